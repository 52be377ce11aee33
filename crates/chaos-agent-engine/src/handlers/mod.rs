//! Fault families other than clock skew. Most wrap a system binary.

pub mod disk;
pub mod file;
pub mod host;
pub mod jvm;
pub mod network;
pub mod process;
pub mod stress;
pub mod user_defined;
pub mod vm;

pub use disk::{parse_size, DiskAction, DiskAttack};
pub use file::{octal_mode, FileAction, FileAttack};
pub use host::{HostAction, HostAttack};
pub use jvm::{JvmAction, JvmAttack};
pub use network::{NetworkAction, NetworkAttack};
pub use process::{ProcessAction, ProcessAttack};
pub use stress::{StressAction, StressAttack};
pub use user_defined::UserDefinedAttack;
pub use vm::{VmAction, VmAttack};
