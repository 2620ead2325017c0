//! 非同期 reaper: SIGCHLD を受けて子プロセスの状態変化を回収するスレッド。
//!
//! `signal_hook` のイテレータで SIGCHLD を受信し、1 回の配送ごとに
//! `waitpid(-1, WNOHANG | WUNTRACED)` を報告がなくなるまで繰り返す。
//! 複数の子が 1 回の配送の間にまとめて状態を変えることがあるため、必ず全件回収する。
//!
//! 回収ループ全体はジョブテーブルの mutex を保持したまま実行する。メインスレッドの
//! 「spawn → 登録 → 監視登録」も同じ mutex の中で行うので、登録前の子を reaper が
//! 先に回収することはない。

use std::io;
use std::thread::{self, JoinHandle};

use libc::pid_t;
use signal_hook::consts::SIGCHLD;
use signal_hook::iterator::{Handle, Signals};
use tracing::debug;

use crate::job::{ChildStatus, Jobs};

/// reaper スレッドのハンドル。Drop でシグナル受信を止めてスレッドを join する。
pub struct Reaper {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl Reaper {
    /// SIGCHLD の受信を登録し、reaper スレッドを起動する。
    ///
    /// 登録かスレッド生成に失敗した場合はエラー。呼び出し側にとって致命的な起動失敗。
    pub fn spawn(jobs: Jobs) -> io::Result<Self> {
        let mut signals = Signals::new([SIGCHLD])?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name("reaper".to_string())
            .spawn(move || {
                for _ in signals.forever() {
                    reap_pending(&jobs);
                }
                debug!("reaper stopped");
            })?;
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// 報告可能な子プロセスの状態変化をすべて回収し、ジョブテーブルに反映する。
///
/// 通知は OS が報告した順に stderr に出す。戻り値は回収した件数。
pub fn reap_pending(jobs: &Jobs) -> usize {
    let mut table = jobs.lock();
    let mut reaped = 0;
    while let Some((pid, status)) = wait_any() {
        reaped += 1;
        debug!(pid, ?status, "child changed state");
        if let Some(notice) = table.record(pid, status) {
            eprintln!("\n{}", notice);
        }
    }
    drop(table);
    jobs.notify_changed();
    reaped
}

/// 非ブロッキングで任意の子の状態変化を 1 件取得する。なければ `None`。
///
/// EINTR はリトライ、ECHILD（子がいない）は `None`。再開通知など対象外の状態は読み飛ばす。
fn wait_any() -> Option<(pid_t, ChildStatus)> {
    loop {
        let mut raw_status: i32 = 0;
        let pid = syscall(|| unsafe {
            libc::waitpid(-1, &mut raw_status, libc::WNOHANG | libc::WUNTRACED)
        });
        match pid {
            Ok(0) => return None,
            Ok(pid) => {
                if let Some(status) = ChildStatus::from_raw(raw_status) {
                    return Some((pid, status));
                }
            }
            Err(e) => {
                if e.raw_os_error() != Some(libc::ECHILD) {
                    debug!(error = %e, "waitpid failed");
                }
                return None;
            }
        }
    }
}

/// システムコール呼び出しのラッパ。-1 なら errno をエラーに変換し、EINTR ならリトライ。
fn syscall<F>(mut f: F) -> io::Result<pid_t>
where
    F: FnMut() -> pid_t,
{
    loop {
        let ret = f();
        if ret >= 0 {
            return Ok(ret);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobTable;
    use crate::spawn;
    use std::time::{Duration, Instant};

    // この関数はプロセス全体の子を回収するため、子を起動するテストはここだけに置く。
    #[test]
    fn reap_pending_collects_exit_status() {
        let jobs = Jobs::new(JobTable::new(4, 1023));
        let pid = {
            let mut table = jobs.lock();
            let pid = spawn::spawn(&["sh", "-c", "exit 3"], None, None).unwrap();
            table.register(pid, "sh -c exit 3 &", true).unwrap();
            table.watch(pid);
            pid
        };

        let deadline = Instant::now() + Duration::from_secs(10);
        while jobs.lock().find_pid(pid).is_some() {
            assert!(Instant::now() < deadline, "child was never reaped");
            reap_pending(&jobs);
            std::thread::sleep(Duration::from_millis(10));
        }

        let outcomes = jobs.wait_for_all(&[pid]);
        assert_eq!(outcomes, vec![(pid, ChildStatus::Exited(3))]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn syscall_retries_interrupted_calls() {
        let mut calls = 0;
        let ret = syscall(|| {
            calls += 1;
            if calls < 3 {
                unsafe { *libc::__errno_location() = libc::EINTR };
                -1
            } else {
                42
            }
        });
        assert_eq!(ret.unwrap(), 42);
        assert_eq!(calls, 3);
    }
}
