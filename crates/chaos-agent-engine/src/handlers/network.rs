use chaos_agent_core::{parse_duration, ExperimentError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::fault::{run_command, Fault, HandlerEnv};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkAction {
    Delay,
    Loss,
    Corrupt,
    Duplicate,
}

/// Traffic impairment through a netem root qdisc on one device.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NetworkAttack {
    pub action: NetworkAction,
    pub device: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub latency: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jitter: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub correlation: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub percent: String,
}

impl NetworkAttack {
    #[must_use]
    pub fn new(action: NetworkAction, device: impl Into<String>) -> Self {
        Self {
            action,
            device: device.into(),
            latency: String::new(),
            jitter: String::new(),
            correlation: String::new(),
            percent: String::new(),
        }
    }

    /// Arguments following `tc qdisc add dev <dev> root netem`.
    pub(crate) fn netem_args(&self) -> Result<Vec<String>, ExperimentError> {
        let mut args = Vec::new();
        match self.action {
            NetworkAction::Delay => {
                args.push("delay".to_string());
                args.push(tc_time("latency", &self.latency)?);
                if !self.jitter.is_empty() {
                    args.push(tc_time("jitter", &self.jitter)?);
                    if !self.correlation.is_empty() {
                        args.push(tc_percent("correlation", &self.correlation)?);
                    }
                }
            }
            NetworkAction::Loss | NetworkAction::Corrupt | NetworkAction::Duplicate => {
                args.push(self.action().to_string());
                args.push(tc_percent("percent", &self.percent)?);
                if !self.correlation.is_empty() {
                    args.push(tc_percent("correlation", &self.correlation)?);
                }
            }
        }
        Ok(args)
    }
}

fn tc_time(field: &str, raw: &str) -> Result<String, ExperimentError> {
    if raw.trim().is_empty() {
        return Err(ExperimentError::BadConfig(format!("{field} MUST be set")));
    }
    let value = parse_duration(raw)?;
    Ok(format!("{}us", value.as_micros()))
}

fn tc_percent(field: &str, raw: &str) -> Result<String, ExperimentError> {
    let trimmed = raw.trim().trim_end_matches('%');
    let value: f64 = trimmed.parse().map_err(|_| {
        ExperimentError::BadConfig(format!("{field} MUST be a percentage, got {raw:?}"))
    })?;
    if !(0.0..=100.0).contains(&value) {
        return Err(ExperimentError::BadConfig(format!(
            "{field} MUST be within [0, 100], got {raw:?}"
        )));
    }
    Ok(format!("{trimmed}%"))
}

impl Fault for NetworkAttack {
    fn action(&self) -> &'static str {
        match self.action {
            NetworkAction::Delay => "delay",
            NetworkAction::Loss => "loss",
            NetworkAction::Corrupt => "corrupt",
            NetworkAction::Duplicate => "duplicate",
        }
    }

    fn validate(&self) -> Result<(), ExperimentError> {
        let device = self.device.trim();
        if device.is_empty() || device.contains(char::is_whitespace) {
            return Err(ExperimentError::BadConfig(
                "device MUST name a single network interface".to_string(),
            ));
        }
        self.netem_args().map(|_| ())
    }

    fn apply(&mut self, env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        let mut args = vec![
            "qdisc".to_string(),
            "add".to_string(),
            "dev".to_string(),
            self.device.clone(),
            "root".to_string(),
            "netem".to_string(),
        ];
        args.extend(self.netem_args()?);
        run_command("tc", &args, env.cancel)?;
        info!(device = %self.device, action = self.action(), "installed netem qdisc");
        Ok(())
    }

    fn revert(&self, env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        let shown = run_command(
            "tc",
            &[
                "qdisc".to_string(),
                "show".to_string(),
                "dev".to_string(),
                self.device.clone(),
            ],
            env.cancel,
        )?;
        if !shown.stdout.contains("netem") {
            debug!(device = %self.device, "no netem qdisc left to remove");
            return Ok(());
        }
        run_command(
            "tc",
            &[
                "qdisc".to_string(),
                "del".to_string(),
                "dev".to_string(),
                self.device.clone(),
                "root".to_string(),
            ],
            env.cancel,
        )?;
        info!(device = %self.device, "removed netem qdisc");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn delay_arguments_use_microseconds() {
        let mut attack = NetworkAttack::new(NetworkAction::Delay, "eth0");
        attack.latency = "100ms".to_string();
        attack.jitter = "10ms".to_string();
        attack.correlation = "25".to_string();
        assert_eq!(
            must_ok(attack.netem_args()),
            vec!["delay", "100000us", "10000us", "25%"]
        );
    }

    #[test]
    fn loss_requires_a_valid_percentage() {
        let mut attack = NetworkAttack::new(NetworkAction::Loss, "eth0");
        assert!(attack.validate().is_err());
        attack.percent = "150".to_string();
        assert!(attack.validate().is_err());
        attack.percent = "12.5%".to_string();
        assert_eq!(must_ok(attack.netem_args()), vec!["loss", "12.5%"]);
    }

    #[test]
    fn device_must_be_a_single_word() {
        let mut attack = NetworkAttack::new(NetworkAction::Duplicate, "eth0 root");
        attack.percent = "1".to_string();
        assert!(attack.validate().is_err());
        attack.device = "eth0".to_string();
        assert!(attack.validate().is_ok());
    }
}
