//! Clock skew for a single process, by redirecting its vDSO
//! `clock_gettime` to an injected replacement that adds a fixed offset.

mod elf;
mod image;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod inject;
mod maps;

use chaos_agent_core::{
    ExperimentError, ExperimentFilter, ExperimentKind, ExperimentStatus, SignedDuration,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{Attack, FaultConfig};
use crate::fault::{Fault, HandlerEnv};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Linux clock ids accepted by `--clock-ids-slice`.
pub const CLOCK_IDS: [(&str, u32); 11] = [
    ("CLOCK_REALTIME", 0),
    ("CLOCK_MONOTONIC", 1),
    ("CLOCK_PROCESS_CPUTIME_ID", 2),
    ("CLOCK_THREAD_CPUTIME_ID", 3),
    ("CLOCK_MONOTONIC_RAW", 4),
    ("CLOCK_REALTIME_COARSE", 5),
    ("CLOCK_MONOTONIC_COARSE", 6),
    ("CLOCK_BOOTTIME", 7),
    ("CLOCK_REALTIME_ALARM", 8),
    ("CLOCK_BOOTTIME_ALARM", 9),
    ("CLOCK_TAI", 11),
];

fn default_mask() -> u64 {
    1
}

/// Turns a comma-separated list of clock names or numeric ids into the id
/// bitmask.
///
/// # Errors
/// Returns [`ExperimentError::BadConfig`] for an unknown name or an empty
/// list.
pub fn parse_clock_ids(raw: &str) -> Result<u64, ExperimentError> {
    let mut mask = 0_u64;
    for name in raw.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        let upper = name.to_ascii_uppercase();
        let id = CLOCK_IDS
            .iter()
            .find(|(known, _)| *known == upper || known.trim_start_matches("CLOCK_") == upper)
            .map(|(_, id)| *id)
            .or_else(|| {
                let id = name.parse::<u32>().ok()?;
                CLOCK_IDS.iter().any(|(_, known)| *known == id).then_some(id)
            })
            .ok_or_else(|| ExperimentError::BadConfig(format!("unknown clock id {name:?}")))?;
        mask |= 1 << id;
    }
    if mask == 0 {
        return Err(ExperimentError::BadConfig(
            "at least one clock id MUST be given".to_string(),
        ));
    }
    Ok(mask)
}

mod hex_bytes {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw).map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ClockAttack {
    pub pid: i32,
    #[serde(default)]
    pub sec_delta: i64,
    #[serde(default)]
    pub nsec_delta: i64,
    #[serde(default = "default_mask")]
    pub clock_ids_mask: u64,
    /// Address of the patched `clock_gettime` entry, once injected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_addr: Option<u64>,
    #[serde(default, with = "hex_bytes", skip_serializing_if = "Vec::is_empty")]
    pub original_bytes: Vec<u8>,
}

impl ClockAttack {
    #[must_use]
    pub fn new(pid: i32, offset: SignedDuration, clock_ids_mask: u64) -> Self {
        Self {
            pid,
            sec_delta: offset.sec,
            nsec_delta: offset.nsec,
            clock_ids_mask,
            origin_addr: None,
            original_bytes: Vec::new(),
        }
    }

    fn is_injected(&self) -> bool {
        self.origin_addr.is_some() && !self.original_bytes.is_empty()
    }

    /// Only one live skew per process: a second injection would capture the
    /// first one's jump as its "original" bytes.
    fn ensure_no_live_skew(&self, env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        let filter = ExperimentFilter {
            status: Some(ExperimentStatus::Success),
            kind: Some(ExperimentKind::Clock),
            ..ExperimentFilter::default()
        };
        for record in env.view.experiments(&filter)? {
            if record.uid == env.uid {
                continue;
            }
            let Ok(config) = FaultConfig::decode(&record.recover_command) else {
                continue;
            };
            if let Attack::Clock(other) = config.attack {
                if other.pid == self.pid {
                    return Err(ExperimentError::BadConfig(format!(
                        "process {} already has clock skew from experiment {}, recover it first",
                        self.pid, record.uid
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Fault for ClockAttack {
    fn action(&self) -> &'static str {
        "skew"
    }

    fn validate(&self) -> Result<(), ExperimentError> {
        if self.pid <= 0 {
            return Err(ExperimentError::BadConfig("pid MUST be positive".to_string()));
        }
        if self.clock_ids_mask == 0 {
            return Err(ExperimentError::BadConfig(
                "at least one clock id MUST be selected".to_string(),
            ));
        }
        if self.nsec_delta.abs() >= NANOS_PER_SEC {
            return Err(ExperimentError::BadConfig(
                "nsec_delta MUST be below one second".to_string(),
            ));
        }
        if self.sec_delta == 0 && self.nsec_delta == 0 {
            return Err(ExperimentError::BadConfig(
                "time offset MUST be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn apply(&mut self, env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        self.ensure_no_live_skew(env)?;

        let fake = image::render(self.clock_ids_mask, self.sec_delta, self.nsec_delta);
        let mut captured = None;
        let injected = inject::inject(self.pid, &fake, |origin, bytes: &[u8]| {
            captured = Some((origin, bytes.to_vec()));
        });
        if let Some((origin, bytes)) = captured {
            self.origin_addr = Some(origin);
            self.original_bytes = bytes;
        }
        injected?;
        info!(
            pid = self.pid,
            sec = self.sec_delta,
            nsec = self.nsec_delta,
            mask = self.clock_ids_mask,
            "clock skew injected"
        );
        Ok(())
    }

    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    fn apply(&mut self, env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        self.ensure_no_live_skew(env)?;
        Err(ExperimentError::Internal(
            "clock skew is only supported on x86_64 Linux".to_string(),
        ))
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn revert(&self, _env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        let Some(origin) = self.origin_addr.filter(|_| self.is_injected()) else {
            return Ok(());
        };
        inject::restore(self.pid, origin, &self.original_bytes)?;
        info!(pid = self.pid, "clock skew removed");
        Ok(())
    }

    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    fn revert(&self, _env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        if self.is_injected() {
            return Err(ExperimentError::Internal(
                "clock skew is only supported on x86_64 Linux".to_string(),
            ));
        }
        Ok(())
    }
}
