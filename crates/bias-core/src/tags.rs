/// Default record-name prefix of the bias supply.
pub const RECORD_PREFIX: &str = "BL15J-EA-HV-01";

/// One exposed readback: bridge key, Prometheus metric and record suffix.
#[derive(Debug, Clone, Copy)]
pub struct Tag {
    pub key: &'static str,
    pub metric: &'static str,
    pub record: &'static str,
}

impl Tag {
    pub fn record_name(&self, prefix: &str) -> String {
        format!("{prefix}:{}", self.record)
    }
}

pub const VOLTAGE_RBV: Tag = Tag {
    key: "voltage",
    metric: "hvbias_voltage_volts",
    record: "VOLTAGE_RBV",
};

pub const CURRENT_RBV: Tag = Tag {
    key: "current_ma",
    metric: "hvbias_current_milliamps",
    record: "CURRENT_RBV",
};

pub const OUTPUT_RBV: Tag = Tag {
    key: "output_on",
    metric: "hvbias_output_on",
    record: "OUTPUT_RBV",
};

pub const STATUS: Tag = Tag {
    key: "status",
    metric: "hvbias_status_index",
    record: "STATUS",
};

pub const HEALTHY: Tag = Tag {
    key: "healthy",
    metric: "hvbias_healthy",
    record: "HEALTHY-STATUS",
};

pub const CYCLE_RUNNING: Tag = Tag {
    key: "cycle_running",
    metric: "hvbias_cycle_running",
    record: "CYCLE-RUNNING",
};

pub const TIME_SINCE_DEPOLARISATION: Tag = Tag {
    key: "seconds_since_depolarisation",
    metric: "hvbias_seconds_since_depolarisation",
    record: "TIME-SINCE-DEPOL",
};

pub const READBACK_TAGS: [Tag; 7] = [
    VOLTAGE_RBV,
    CURRENT_RBV,
    OUTPUT_RBV,
    STATUS,
    HEALTHY,
    CYCLE_RUNNING,
    TIME_SINCE_DEPOLARISATION,
];
