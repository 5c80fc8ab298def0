//! Preview dev servers: one supervised child process per project.

pub mod install;
pub mod logs;
pub mod ports;
pub mod probe;
pub mod process;
pub mod state;
pub mod supervisor;
pub mod workspace;

pub use install::{InstallOutput, InstallSpec};
pub use logs::{LogRing, SharedLogs};
pub use ports::{PortAllocator, PortLease};
pub use probe::{HttpProbe, ReadinessProbe, TcpProbe};
pub use process::{DevServerProcess, DevServerSpec, ExitInfo};
pub use state::{PreviewState, PreviewStatus};
pub use supervisor::{PreviewSettings, PreviewSupervisor};
pub use workspace::{ProjectsRoot, WorkspaceResolver};
