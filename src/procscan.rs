use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub args: Vec<String>,
}

/// Lists OS processes together with their full argument vectors.
pub trait ProcessEnumerator: Send + Sync {
    fn processes(&self) -> Vec<ProcessInfo>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SysinfoEnumerator;

impl ProcessEnumerator for SysinfoEnumerator {
    fn processes(&self) -> Vec<ProcessInfo> {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        let mut processes = system
            .processes()
            .values()
            .filter(|process| process.thread_kind().is_none())
            .map(|process| ProcessInfo {
                pid: process.pid().as_u32(),
                args: process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy().to_string())
                    .collect(),
            })
            .filter(|info| !info.args.is_empty())
            .collect::<Vec<_>>();
        processes.sort_by_key(|info| info.pid);
        processes
    }
}
