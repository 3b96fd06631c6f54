use chrono::{DateTime, Utc};
use serde::Serialize;
use tabled::Tabled;

use proxyfleet_core::instance::InstanceRecord;
use proxyfleet_core::naming::login_user_for_image;
use proxyfleet_core::time::{age_secs, format_age, format_timestamp};

/// Display row for `status`.
#[derive(Debug, Serialize, Tabled)]
pub struct InstanceRow {
    #[tabled(rename = "INSTANCE")]
    pub instance_id: String,
    #[tabled(rename = "STATE")]
    pub state: String,
    #[tabled(rename = "ADDRESS")]
    pub address: String,
    #[tabled(rename = "LAUNCHED")]
    pub launch_time: String,
    #[tabled(rename = "AGE")]
    pub age: String,
    #[tabled(rename = "USER")]
    pub login_user: String,
}

impl InstanceRow {
    pub fn new(record: &InstanceRecord, now: DateTime<Utc>) -> Self {
        Self {
            instance_id: record.instance_id.clone(),
            state: record.state.to_string(),
            address: if record.public_address.is_empty() {
                "-".to_string()
            } else {
                record.public_address.clone()
            },
            launch_time: format_timestamp(record.launch_time),
            age: format_age(age_secs(record.launch_time, now)),
            login_user: login_user_for_image(&record.image_id).to_string(),
        }
    }
}
