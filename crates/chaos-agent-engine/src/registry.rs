//! Static table of fault families the agent knows how to run.

use chaos_agent_core::ExperimentKind;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HandlerDescriptor {
    pub kind: ExperimentKind,
    pub name: &'static str,
    pub actions: &'static [&'static str],
    /// `false` means `revert` always reports the fault as non-recoverable.
    pub recoverable: bool,
}

pub const HANDLERS: [HandlerDescriptor; 10] = [
    HandlerDescriptor {
        kind: ExperimentKind::Process,
        name: "process",
        actions: &["kill", "stop"],
        recoverable: true,
    },
    HandlerDescriptor {
        kind: ExperimentKind::Network,
        name: "network",
        actions: &["delay", "loss", "corrupt", "duplicate"],
        recoverable: true,
    },
    HandlerDescriptor {
        kind: ExperimentKind::Stress,
        name: "stress",
        actions: &["cpu", "mem"],
        recoverable: true,
    },
    HandlerDescriptor {
        kind: ExperimentKind::Disk,
        name: "disk",
        actions: &["fill", "write-payload", "read-payload"],
        recoverable: true,
    },
    HandlerDescriptor {
        kind: ExperimentKind::Host,
        name: "host",
        actions: &["shutdown", "reboot"],
        recoverable: false,
    },
    HandlerDescriptor {
        kind: ExperimentKind::Jvm,
        name: "jvm",
        actions: &["gc"],
        recoverable: false,
    },
    HandlerDescriptor {
        kind: ExperimentKind::Clock,
        name: "clock",
        actions: &["skew"],
        recoverable: true,
    },
    HandlerDescriptor {
        kind: ExperimentKind::File,
        name: "file",
        actions: &["create", "modify", "delete", "rename", "append", "replace"],
        recoverable: true,
    },
    HandlerDescriptor {
        kind: ExperimentKind::Vm,
        name: "vm",
        actions: &["destroy"],
        recoverable: false,
    },
    HandlerDescriptor {
        kind: ExperimentKind::UserDefined,
        name: "user_defined",
        actions: &["run"],
        recoverable: true,
    },
];

/// Kinds without an entry (redis, kafka, http, patroni) are recorded but
/// have no handler in this agent.
#[must_use]
pub fn descriptor(kind: ExperimentKind) -> Option<&'static HandlerDescriptor> {
    HANDLERS.iter().find(|handler| handler.kind == kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Attack;
    use crate::handlers::{
        DiskAction, DiskAttack, FileAction, FileAttack, HostAction, HostAttack, JvmAction,
        JvmAttack, NetworkAction, NetworkAttack, ProcessAction, ProcessAttack, StressAction,
        StressAttack, UserDefinedAttack, VmAction, VmAttack,
    };
    use crate::clock::ClockAttack;
    use chaos_agent_core::SignedDuration;

    #[test]
    fn every_kind_resolves_at_most_once() {
        for kind in ExperimentKind::ALL {
            let matches = HANDLERS.iter().filter(|handler| handler.kind == kind).count();
            assert!(matches <= 1, "{kind} registered twice");
        }
        for kind in [
            ExperimentKind::Redis,
            ExperimentKind::Kafka,
            ExperimentKind::Http,
            ExperimentKind::Patroni,
        ] {
            assert!(descriptor(kind).is_none());
        }
    }

    #[test]
    fn names_match_kind_names() {
        for handler in &HANDLERS {
            assert_eq!(handler.name, handler.kind.as_str());
        }
    }

    #[test]
    fn descriptors_list_the_actions_handlers_report() {
        let samples = [
            Attack::Process(ProcessAttack::new(ProcessAction::Kill, "1")),
            Attack::Process(ProcessAttack::new(ProcessAction::Stop, "1")),
            Attack::Network(NetworkAttack::new(NetworkAction::Duplicate, "lo")),
            Attack::Stress(StressAttack::new(StressAction::Mem)),
            Attack::Disk(DiskAttack::new(DiskAction::ReadPayload, "/tmp/x", "1M")),
            Attack::Host(HostAttack { action: HostAction::Reboot, dry_run: true }),
            Attack::Jvm(JvmAttack { action: JvmAction::Gc, pid: 1 }),
            Attack::Clock(ClockAttack::new(1, SignedDuration { sec: 1, nsec: 0 }, 1)),
            Attack::File(FileAttack::new(FileAction::Replace)),
            Attack::Vm(VmAttack { action: VmAction::Destroy, vm_name: "vm0".to_string() }),
            Attack::UserDefined(UserDefinedAttack::new("true", "true")),
        ];
        for attack in samples {
            let handler = match descriptor(attack.kind()) {
                Some(handler) => handler,
                None => panic!("{} has no descriptor", attack.kind()),
            };
            assert!(handler.actions.contains(&attack.action()), "{} {}", handler.name, attack.action());
        }
    }

    #[test]
    fn irreversible_families_are_flagged() {
        let irreversible: Vec<_> = HANDLERS
            .iter()
            .filter(|handler| !handler.recoverable)
            .map(|handler| handler.kind)
            .collect();
        assert_eq!(
            irreversible,
            vec![ExperimentKind::Host, ExperimentKind::Jvm, ExperimentKind::Vm]
        );
    }
}
