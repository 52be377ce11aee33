//! Typed experiment configuration and its persisted JSON form.
//!
//! The encoded [`FaultConfig`] is what a record stores as its
//! `recover_command`: it carries the attack parameters plus whatever the
//! handler stashed during `apply`, so recovery can run from it alone.

use chaos_agent_core::{parse_duration, ExperimentError, ExperimentKind, Uid};
use serde::{Deserialize, Serialize};

use crate::clock::ClockAttack;
use crate::fault::Fault;
use crate::handlers::{
    DiskAttack, FileAttack, HostAttack, JvmAttack, NetworkAttack, ProcessAttack, StressAttack,
    UserDefinedAttack, VmAttack,
};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attack {
    Process(ProcessAttack),
    Network(NetworkAttack),
    Stress(StressAttack),
    Disk(DiskAttack),
    Host(HostAttack),
    Jvm(JvmAttack),
    Clock(ClockAttack),
    File(FileAttack),
    Vm(VmAttack),
    UserDefined(UserDefinedAttack),
}

impl Attack {
    #[must_use]
    pub fn kind(&self) -> ExperimentKind {
        match self {
            Self::Process(_) => ExperimentKind::Process,
            Self::Network(_) => ExperimentKind::Network,
            Self::Stress(_) => ExperimentKind::Stress,
            Self::Disk(_) => ExperimentKind::Disk,
            Self::Host(_) => ExperimentKind::Host,
            Self::Jvm(_) => ExperimentKind::Jvm,
            Self::Clock(_) => ExperimentKind::Clock,
            Self::File(_) => ExperimentKind::File,
            Self::Vm(_) => ExperimentKind::Vm,
            Self::UserDefined(_) => ExperimentKind::UserDefined,
        }
    }

    #[must_use]
    pub fn fault(&self) -> &dyn Fault {
        match self {
            Self::Process(attack) => attack,
            Self::Network(attack) => attack,
            Self::Stress(attack) => attack,
            Self::Disk(attack) => attack,
            Self::Host(attack) => attack,
            Self::Jvm(attack) => attack,
            Self::Clock(attack) => attack,
            Self::File(attack) => attack,
            Self::Vm(attack) => attack,
            Self::UserDefined(attack) => attack,
        }
    }

    pub fn fault_mut(&mut self) -> &mut dyn Fault {
        match self {
            Self::Process(attack) => attack,
            Self::Network(attack) => attack,
            Self::Stress(attack) => attack,
            Self::Disk(attack) => attack,
            Self::Host(attack) => attack,
            Self::Jvm(attack) => attack,
            Self::Clock(attack) => attack,
            Self::File(attack) => attack,
            Self::Vm(attack) => attack,
            Self::UserDefined(attack) => attack,
        }
    }

    #[must_use]
    pub fn action(&self) -> &'static str {
        self.fault().action()
    }
}

/// Recurrence of an experiment. Both fields empty means one-shot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Schedule {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cron: String,
    /// How long each fire keeps the fault in place.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub duration: String,
}

impl Schedule {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cron.trim().is_empty() && self.duration.trim().is_empty()
    }

    /// # Errors
    /// Returns [`ExperimentError::BadConfig`] for a malformed cron or
    /// duration, or a duration without a cron.
    pub fn validate(&self) -> Result<(), ExperimentError> {
        let cron = self.cron.trim();
        let duration = self.duration.trim();
        if cron.is_empty() {
            if !duration.is_empty() {
                return Err(ExperimentError::BadConfig(
                    "duration requires a cron schedule".to_string(),
                ));
            }
            return Ok(());
        }
        crate::scheduler::parse_cron(cron)?;
        if !duration.is_empty() && parse_duration(duration)?.is_zero() {
            return Err(ExperimentError::BadConfig(
                "duration MUST be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn schedule_is_empty(schedule: &Schedule) -> bool {
    schedule.is_empty()
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FaultConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uid>,
    #[serde(default, skip_serializing_if = "schedule_is_empty")]
    pub schedule: Schedule,
    #[serde(flatten)]
    pub attack: Attack,
}

impl FaultConfig {
    #[must_use]
    pub fn new(attack: Attack) -> Self {
        Self {
            uid: None,
            schedule: Schedule::default(),
            attack,
        }
    }

    #[must_use]
    pub fn with_schedule(mut self, cron: impl Into<String>, duration: impl Into<String>) -> Self {
        self.schedule = Schedule {
            cron: cron.into(),
            duration: duration.into(),
        };
        self
    }

    #[must_use]
    pub fn with_uid(mut self, uid: Uid) -> Self {
        self.uid = Some(uid);
        self
    }

    #[must_use]
    pub fn kind(&self) -> ExperimentKind {
        self.attack.kind()
    }

    /// # Errors
    /// Returns [`ExperimentError::BadConfig`] describing the first problem.
    pub fn validate(&self) -> Result<(), ExperimentError> {
        self.schedule.validate()?;
        self.attack.fault().validate()
    }

    /// # Errors
    /// Returns [`ExperimentError::Internal`] if serialization fails.
    pub fn encode(&self) -> Result<String, ExperimentError> {
        serde_json::to_string(self)
            .map_err(|err| ExperimentError::Internal(format!("failed to encode config: {err}")))
    }

    /// # Errors
    /// Returns [`ExperimentError::BadConfig`] for malformed JSON or an
    /// unknown kind.
    pub fn decode(raw: &str) -> Result<Self, ExperimentError> {
        serde_json::from_str(raw)
            .map_err(|err| ExperimentError::BadConfig(format!("invalid experiment config: {err}")))
    }

    /// Builds a config from a request body whose kind travels out of band,
    /// as in `POST /api/attack/{kind}`.
    ///
    /// # Errors
    /// Returns [`ExperimentError::BadConfig`] when the body is not an object
    /// or does not match the kind's parameters.
    pub fn from_json_value(
        kind: ExperimentKind,
        body: serde_json::Value,
    ) -> Result<Self, ExperimentError> {
        let serde_json::Value::Object(mut fields) = body else {
            return Err(ExperimentError::BadConfig(
                "request body MUST be a JSON object".to_string(),
            ));
        };
        fields.insert(
            "kind".to_string(),
            serde_json::Value::String(kind.as_str().to_string()),
        );
        serde_json::from_value(serde_json::Value::Object(fields)).map_err(|err| {
            ExperimentError::BadConfig(format!("invalid {kind} parameters: {err}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{FileAction, ProcessAction};
    use chaos_agent_core::SignedDuration;
    use proptest::prelude::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn encoding_is_flat_and_tagged() {
        let config = FaultConfig::new(Attack::UserDefined(UserDefinedAttack::new(
            "touch /tmp/x",
            "rm -f /tmp/x",
        )))
        .with_schedule("*/5 * * * *", "30s");
        let value: serde_json::Value = must_ok(serde_json::from_str(&must_ok(config.encode())));
        assert_eq!(value["kind"], "user_defined");
        assert_eq!(value["attack_cmd"], "touch /tmp/x");
        assert_eq!(value["schedule"]["cron"], "*/5 * * * *");
        assert!(value.get("uid").is_none());
    }

    #[test]
    fn one_shot_config_omits_schedule() {
        let config = FaultConfig::new(Attack::Process(ProcessAttack::new(ProcessAction::Stop, "1234")));
        let encoded = must_ok(config.encode());
        assert!(!encoded.contains("schedule"));
        assert_eq!(must_ok(FaultConfig::decode(&encoded)), config);
    }

    #[test]
    fn request_body_gets_kind_from_path() {
        let config = must_ok(FaultConfig::from_json_value(
            ExperimentKind::File,
            json!({"action": "append", "file_name": "app.log", "dir_name": "/tmp", "data": "x"}),
        ));
        assert_eq!(config.kind(), ExperimentKind::File);
        assert_eq!(config.attack.action(), "append");

        assert!(matches!(
            FaultConfig::from_json_value(ExperimentKind::File, json!(["not", "an", "object"])),
            Err(ExperimentError::BadConfig(_))
        ));
        assert!(matches!(
            FaultConfig::from_json_value(ExperimentKind::Redis, json!({})),
            Err(ExperimentError::BadConfig(_))
        ));
    }

    #[test]
    fn duration_without_cron_is_rejected() {
        let config = FaultConfig::new(Attack::UserDefined(UserDefinedAttack::new("true", "true")))
            .with_schedule("", "10s");
        assert!(matches!(config.validate(), Err(ExperimentError::BadConfig(message)) if message.contains("cron")));
    }

    #[test]
    fn schedule_validation() {
        let bad_cron = Schedule { cron: "every minute".to_string(), duration: String::new() };
        assert!(bad_cron.validate().is_err());
        let zero = Schedule { cron: "* * * * *".to_string(), duration: "0s".to_string() };
        assert!(zero.validate().is_err());
        let ok = Schedule { cron: "0 */2 * * * *".to_string(), duration: "1m".to_string() };
        must_ok(ok.validate());
        assert!(Schedule::default().is_empty());
    }

    #[test]
    fn unknown_kind_fails_to_decode() {
        assert!(matches!(
            FaultConfig::decode(r#"{"kind":"dns","domain":"example.com"}"#),
            Err(ExperimentError::BadConfig(_))
        ));
    }

    fn attack_strategy() -> impl Strategy<Value = Attack> {
        prop_oneof![
            ("[a-z ]{1,16}", "[a-z ]{0,16}")
                .prop_map(|(attack, recover)| Attack::UserDefined(UserDefinedAttack::new(attack, recover))),
            (1_i32..100_000, -1_000_000_i64..1_000_000, any::<u64>(), proptest::collection::vec(any::<u8>(), 0..16))
                .prop_map(|(pid, sec, mask, bytes)| {
                    let mut attack = ClockAttack::new(pid, SignedDuration { sec, nsec: 0 }, mask);
                    if !bytes.is_empty() {
                        attack.origin_addr = Some(0x7fff_1234_0000);
                        attack.original_bytes = bytes;
                    }
                    Attack::Clock(attack)
                }),
            ("[a-z]{1,8}", "[a-z0-9 ]{0,12}", 1_u32..5).prop_map(|(name, data, count)| {
                let mut attack = FileAttack::new(FileAction::Append);
                attack.file_name = format!("{name}.log");
                attack.dir_name = "/tmp".to_string();
                attack.data = data;
                attack.count = count;
                Attack::File(attack)
            }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn encode_decode_encode_is_stable(
            attack in attack_strategy(),
            cron in prop_oneof![Just(String::new()), Just("*/1 * * * *".to_string())],
            with_uid in any::<bool>(),
        ) {
            let mut config = FaultConfig::new(attack).with_schedule(cron, "");
            if with_uid {
                config = config.with_uid(Uid::new());
            }
            let first = must_ok(config.encode());
            let decoded = must_ok(FaultConfig::decode(&first));
            let second = must_ok(decoded.encode());
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(decoded, config);
        }
    }
}
