use std::io;

/// Existence probe and termination for OS processes.
pub trait ProcessProbe: Send + Sync {
    /// `true` only when the process exists and may be signalled by us.
    /// Permission errors count as dead.
    fn is_alive(&self, pid: u32) -> bool;

    /// Sends SIGTERM. A process that is already gone yields `ErrorKind::NotFound`.
    fn terminate(&self, pid: u32) -> io::Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OsProbe;

impl ProcessProbe for OsProbe {
    fn is_alive(&self, pid: u32) -> bool {
        match to_pid(pid) {
            Some(pid) => unsafe { libc::kill(pid, 0) == 0 },
            None => false,
        }
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let target = to_pid(pid).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {pid}"))
        })?;
        let result = unsafe { libc::kill(target, libc::SIGTERM) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("process {pid} not found"),
                ));
            }
            return Err(err);
        }
        Ok(())
    }
}

// 0 and negative values address process groups in kill(2), never probe those.
fn to_pid(pid: u32) -> Option<libc::pid_t> {
    if pid == 0 {
        return None;
    }
    libc::pid_t::try_from(pid).ok()
}
