//! ptrace session that patches `clock_gettime` in a live process.
//!
//! Every ptrace request must come from the thread that attached, so each
//! session runs start to finish on one dedicated thread, and sessions are
//! serialized process-wide.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::sync::{Mutex, PoisonError};
use std::thread;

use chaos_agent_core::ExperimentError;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::elf;
use super::image::{self, IMAGE_LEN, JUMP_LEN};
use super::maps::{self, Mapping};

static SESSION: Mutex<()> = Mutex::new(());

const SYSCALL_INSN: [u8; 2] = [0x0f, 0x05];
const SYS_MMAP: u64 = 9;
const PROT_RWX: u64 = 0x7;
const MAP_PRIVATE_ANONYMOUS: u64 = 0x22;
const FAKE_PAGE_LEN: u64 = 4096;
const VDSO_SYMBOLS: [&str; 2] = ["clock_gettime", "__vdso_clock_gettime"];

fn ptrace_error(what: &str, pid: Pid, errno: Errno) -> ExperimentError {
    ExperimentError::Transient(format!("failed to {what} {pid}: {errno}"))
}

/// Runs `session` on a dedicated thread while holding the global lock.
fn in_session<T, F>(session: F) -> Result<T, ExperimentError>
where
    T: Send,
    F: FnOnce() -> Result<T, ExperimentError> + Send,
{
    let _guard = SESSION.lock().unwrap_or_else(PoisonError::into_inner);
    thread::scope(|scope| {
        let handle = thread::Builder::new()
            .name("chaos-agent-ptrace".to_string())
            .spawn_scoped(scope, session)
            .map_err(|err| {
                ExperimentError::Internal(format!("failed to spawn ptrace thread: {err}"))
            })?;
        handle
            .join()
            .map_err(|_| ExperimentError::Internal("ptrace thread panicked".to_string()))?
    })
}

struct ProcMem {
    pid: i32,
    file: File,
}

impl ProcMem {
    fn open(pid: i32) -> Result<Self, ExperimentError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/proc/{pid}/mem"))
            .map_err(|err| {
                ExperimentError::Transient(format!("failed to open memory of {pid}: {err}"))
            })?;
        Ok(Self { pid, file })
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), ExperimentError> {
        self.file.read_exact_at(buf, addr).map_err(|err| {
            ExperimentError::Transient(format!(
                "failed to read {} bytes at {addr:#x} in {}: {err}",
                buf.len(),
                self.pid
            ))
        })
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<(), ExperimentError> {
        self.file.write_all_at(data, addr).map_err(|err| {
            ExperimentError::Transient(format!(
                "failed to write {} bytes at {addr:#x} in {}: {err}",
                data.len(),
                self.pid
            ))
        })
    }
}

fn list_threads(pid: i32) -> Result<Vec<Pid>, ExperimentError> {
    let entries = fs::read_dir(format!("/proc/{pid}/task"))
        .map_err(|err| ExperimentError::Transient(format!("process {pid} not found: {err}")))?;
    Ok(entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .map(Pid::from_raw)
        .collect())
}

/// Every thread of a process held in ptrace-stop. Dropping it detaches.
struct Tracee {
    leader: Pid,
    threads: Vec<Pid>,
    pending: HashMap<Pid, Signal>,
}

impl Tracee {
    fn attach(pid: i32) -> Result<Self, ExperimentError> {
        let mut tracee = Self {
            leader: Pid::from_raw(pid),
            threads: Vec::new(),
            pending: HashMap::new(),
        };
        // Threads spawned while we attach show up on the next pass.
        loop {
            let mut added = false;
            for tid in list_threads(pid)? {
                if tracee.threads.contains(&tid) {
                    continue;
                }
                match ptrace::attach(tid) {
                    Ok(()) => {}
                    Err(Errno::ESRCH) => continue,
                    Err(errno) => return Err(ptrace_error("attach to thread", tid, errno)),
                }
                tracee.threads.push(tid);
                tracee.wait_for_stop(tid)?;
                added = true;
            }
            if !added {
                break;
            }
        }
        if !tracee.threads.contains(&tracee.leader) {
            return Err(ExperimentError::Transient(format!(
                "process {pid} exited while attaching"
            )));
        }
        debug!(pid, threads = tracee.threads.len(), "attached");
        Ok(tracee)
    }

    /// Waits for the SIGSTOP of the attach, stashing anything else.
    fn wait_for_stop(&mut self, tid: Pid) -> Result<(), ExperimentError> {
        loop {
            match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => return Ok(()),
                Ok(WaitStatus::Stopped(_, signal)) => {
                    self.pending.insert(tid, signal);
                    ptrace::cont(tid, None).map_err(|errno| ptrace_error("resume", tid, errno))?;
                }
                Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => {
                    self.threads.retain(|thread| *thread != tid);
                    return Ok(());
                }
                Ok(_) | Err(Errno::EINTR) => {}
                Err(errno) => return Err(ptrace_error("wait for", tid, errno)),
            }
        }
    }

    /// Maps one anonymous RWX page in the tracee by executing an `mmap`
    /// syscall at its current instruction pointer.
    fn remote_mmap(&mut self, mem: &ProcMem) -> Result<u64, ExperimentError> {
        let leader = self.leader;
        let saved = ptrace::getregs(leader).map_err(|errno| ptrace_error("read registers of", leader, errno))?;
        let mut original = [0_u8; SYSCALL_INSN.len()];
        mem.read(saved.rip, &mut original)?;
        mem.write(saved.rip, &SYSCALL_INSN)?;

        let mapped = self.step_mmap(saved);

        let restored_code = mem.write(saved.rip, &original);
        let restored_regs = ptrace::setregs(leader, saved)
            .map_err(|errno| ptrace_error("restore registers of", leader, errno));
        let addr = mapped?;
        restored_code?;
        restored_regs?;
        Ok(addr)
    }

    fn step_mmap(&mut self, saved: nix::libc::user_regs_struct) -> Result<u64, ExperimentError> {
        let leader = self.leader;
        let mut regs = saved;
        regs.rax = SYS_MMAP;
        regs.orig_rax = u64::MAX;
        regs.rdi = 0;
        regs.rsi = FAKE_PAGE_LEN;
        regs.rdx = PROT_RWX;
        regs.r10 = MAP_PRIVATE_ANONYMOUS;
        regs.r8 = u64::MAX;
        regs.r9 = 0;
        ptrace::setregs(leader, regs).map_err(|errno| ptrace_error("write registers of", leader, errno))?;

        loop {
            ptrace::step(leader, None).map_err(|errno| ptrace_error("single-step", leader, errno))?;
            match waitpid(leader, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => break,
                Ok(WaitStatus::Stopped(_, signal)) => {
                    self.pending.insert(leader, signal);
                }
                Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => {
                    self.threads.retain(|thread| *thread != leader);
                    return Err(ExperimentError::Transient(format!(
                        "process {leader} exited during injection"
                    )));
                }
                Ok(_) | Err(Errno::EINTR) => {}
                Err(errno) => return Err(ptrace_error("wait for", leader, errno)),
            }
        }

        let result = ptrace::getregs(leader)
            .map_err(|errno| ptrace_error("read registers of", leader, errno))?
            .rax;
        #[allow(clippy::cast_possible_wrap)]
        let signed = result as i64;
        if (-4095..0).contains(&signed) {
            let errno = Errno::from_raw(i32::try_from(-signed).unwrap_or(0));
            return Err(ExperimentError::Transient(format!(
                "remote mmap in {leader} failed: {errno}"
            )));
        }
        Ok(result)
    }

    fn release(&mut self) -> Result<(), ExperimentError> {
        let mut first_error = None;
        for tid in std::mem::take(&mut self.threads) {
            let signal = self.pending.remove(&tid);
            match ptrace::detach(tid, signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(errno) => {
                    first_error.get_or_insert(ptrace_error("detach from", tid, errno));
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn detach(mut self) -> Result<(), ExperimentError> {
        self.release()
    }
}

impl Drop for Tracee {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(pid = %self.leader, error = %err, "detach failed");
        }
    }
}

fn find_reusable_page(maps: &[Mapping], mem: &ProcMem) -> Option<u64> {
    maps.iter()
        .filter(|mapping| mapping.is_anonymous_rwx() && mapping.len() >= IMAGE_LEN as u64)
        .find(|mapping| {
            let mut head = [0_u8; image::CODE_LEN];
            mem.read(mapping.start, &mut head).is_ok() && image::has_image_prefix(&head)
        })
        .map(|mapping| mapping.start)
}

fn locate_clock_gettime(pid: i32, maps: &[Mapping], mem: &ProcMem) -> Result<u64, ExperimentError> {
    let vdso = maps
        .iter()
        .find(|mapping| mapping.is_vdso())
        .ok_or_else(|| ExperimentError::Transient(format!("process {pid} has no vDSO")))?;
    let len = usize::try_from(vdso.len())
        .map_err(|_| ExperimentError::Transient("vDSO mapping too large".to_string()))?;
    let mut vdso_image = vec![0_u8; len];
    mem.read(vdso.start, &mut vdso_image)?;

    let symbol = elf::find_symbol(&vdso_image, &VDSO_SYMBOLS)?;
    let site = elf::patch_site(&vdso_image, symbol, JUMP_LEN)?;
    Ok(vdso.start + site)
}

/// Redirects the vDSO `clock_gettime` of `pid` to `fake`.
///
/// `on_capture` receives the entry address and the bytes about to be
/// overwritten before the jump is written, so the caller can persist them
/// even if a later step fails.
pub(crate) fn inject<F>(pid: i32, fake: &[u8; IMAGE_LEN], on_capture: F) -> Result<(), ExperimentError>
where
    F: FnOnce(u64, &[u8]) + Send,
{
    in_session(move || {
        let mem = ProcMem::open(pid)?;
        let mut tracee = Tracee::attach(pid)?;
        let maps = maps::read_maps(pid)?;

        let origin = locate_clock_gettime(pid, &maps, &mem)?;
        let mut original = [0_u8; JUMP_LEN];
        mem.read(origin, &mut original)?;
        if image::is_jump(&original) {
            return Err(ExperimentError::BadConfig(format!(
                "clock_gettime of process {pid} is already redirected"
            )));
        }

        let page = match find_reusable_page(&maps, &mem) {
            Some(page) => page,
            None => tracee.remote_mmap(&mem)?,
        };
        mem.write(page, fake)?;

        on_capture(origin, &original);
        mem.write(origin, &image::jump_to(page))?;
        debug!(pid, origin = format_args!("{origin:#x}"), page = format_args!("{page:#x}"), "clock_gettime redirected");
        tracee.detach()
    })
}

/// Writes `original` back over the jump at `origin`. A process that no
/// longer exists needs no restoring.
pub(crate) fn restore(pid: i32, origin: u64, original: &[u8]) -> Result<(), ExperimentError> {
    if kill(Pid::from_raw(pid), None) == Err(Errno::ESRCH) {
        warn!(pid, "process is gone, nothing to restore");
        return Ok(());
    }
    in_session(move || {
        let mem = ProcMem::open(pid)?;
        let tracee = Tracee::attach(pid)?;
        let mut current = vec![0_u8; original.len()];
        mem.read(origin, &mut current)?;
        if current == original {
            debug!(pid, "clock_gettime already restored");
        } else {
            if !image::is_jump(&current) {
                warn!(pid, "unexpected bytes at clock_gettime, restoring anyway");
            }
            mem.write(origin, original)?;
        }
        tracee.detach()
    })
}
