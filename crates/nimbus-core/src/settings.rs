//! Deployment settings.

use crate::types::ExecutionHandle;
use serde::{Deserialize, Serialize};

/// Deployment-wide configuration shared by every handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Cloud region all services run in.
    pub region: String,

    /// Account number used in resource names.
    pub account: String,

    /// Optional usergroup appended to function and state machine names.
    pub usergroup: Option<String>,

    /// Optional development suffix appended after the usergroup.
    pub dev_suffix: Option<String>,

    /// Name of the keyed job index table.
    pub index_table: String,

    /// Primary state machine override. Derived from the suffix when unset.
    pub state_machine: Option<String>,

    /// Prefix of the `Name` tag carried by job instances.
    pub instance_tag_prefix: String,

    /// Delay between cost update attempts.
    pub cost_wait_seconds: u64,

    /// Days after the job stopped before the cost loop gives up.
    pub cost_give_up_days: i64,

    /// Minutes an instance may take to report that the job started.
    pub start_grace_minutes: i64,

    /// Max CPU utilization (%) below which a running instance counts as idle.
    pub idle_cpu_threshold: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            account: "000000000000".to_string(),
            usergroup: None,
            dev_suffix: None,
            index_table: "nimbus-master".to_string(),
            state_machine: None,
            instance_tag_prefix: "awsem-".to_string(),
            cost_wait_seconds: 43200,
            cost_give_up_days: 3,
            start_grace_minutes: 10,
            idle_cpu_threshold: 1.0,
        }
    }
}

impl Settings {
    /// Defaults overlaid with `NIMBUS_*` / `AWS_ACCOUNT_NUMBER` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(region) = get("NIMBUS_AWS_REGION") {
            settings.region = region;
        }
        if let Some(account) = get("AWS_ACCOUNT_NUMBER") {
            settings.account = account;
        }
        settings.usergroup = get("NIMBUS_USERGROUP");
        settings.dev_suffix = get("NIMBUS_DEV_SUFFIX");
        if let Some(table) = get("NIMBUS_INDEX_TABLE") {
            settings.index_table = table;
        }
        settings.state_machine = get("NIMBUS_STATE_MACHINE");
        settings
    }

    /// Suffix appended to function and state machine names.
    pub fn function_suffix(&self) -> String {
        match (self.usergroup.as_deref(), self.dev_suffix.as_deref()) {
            (Some(group), Some(dev)) => format!("_{}_{}", group, dev),
            (Some(group), None) => format!("_{}", group),
            (None, Some(dev)) => format!("_{}", dev),
            (None, None) => String::new(),
        }
    }

    /// Resource name of a handler function.
    pub fn lambda_arn(&self, function: &str) -> String {
        format!(
            "arn:aws:lambda:{}:{}:function:{}{}",
            self.region,
            self.account,
            function,
            self.function_suffix()
        )
    }

    pub fn primary_state_machine_name(&self) -> String {
        self.state_machine
            .clone()
            .unwrap_or_else(|| format!("nimbus_primary{}", self.function_suffix()))
    }

    pub fn cost_updater_state_machine_name(&self) -> String {
        format!("{}_costupdater", self.primary_state_machine_name())
    }

    pub fn state_machine_arn(&self, state_machine: &str) -> String {
        format!(
            "arn:aws:states:{}:{}:stateMachine:{}",
            self.region, self.account, state_machine
        )
    }

    pub fn execution_handle(&self, state_machine: &str, execution_name: &str) -> ExecutionHandle {
        ExecutionHandle::new(&self.region, &self.account, state_machine, execution_name)
    }

    /// `Name` tag value of the instances running a job.
    pub fn instance_tag(&self, job_id: &str) -> String {
        format!("{}{}", self.instance_tag_prefix, job_id)
    }

    /// Region display name used by the pricing catalog.
    pub fn region_display_name(&self) -> Option<&'static str> {
        region_display_name(&self.region)
    }
}

/// Pricing-catalog location name for a region code.
pub fn region_display_name(region: &str) -> Option<&'static str> {
    let name = match region {
        "us-east-1" => "US East (N. Virginia)",
        "us-east-2" => "US East (Ohio)",
        "us-west-1" => "US West (N. California)",
        "us-west-2" => "US West (Oregon)",
        "ca-central-1" => "Canada (Central)",
        "eu-central-1" => "EU (Frankfurt)",
        "eu-west-1" => "EU (Ireland)",
        "eu-west-2" => "EU (London)",
        "eu-west-3" => "EU (Paris)",
        "eu-north-1" => "EU (Stockholm)",
        "ap-east-1" => "Asia Pacific (Hong Kong)",
        "ap-south-1" => "Asia Pacific (Mumbai)",
        "ap-northeast-1" => "Asia Pacific (Tokyo)",
        "ap-northeast-2" => "Asia Pacific (Seoul)",
        "ap-northeast-3" => "Asia Pacific (Osaka)",
        "ap-southeast-1" => "Asia Pacific (Singapore)",
        "ap-southeast-2" => "Asia Pacific (Sydney)",
        "sa-east-1" => "South America (Sao Paulo)",
        "me-south-1" => "Middle East (Bahrain)",
        "af-south-1" => "Africa (Cape Town)",
        _ => return None,
    };
    Some(name)
}
