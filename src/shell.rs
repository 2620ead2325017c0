//! シェルの実行状態を保持するモジュール。
//!
//! 環境変数は `std::env` を直接使用し、子プロセスへの自動継承を活用する。
//! ジョブテーブル（[`Jobs`]）、容量制限（[`Limits`]）、reaper スレッドのハンドルを保持する。

use std::io;

use libc::c_int;

use crate::config::Limits;
use crate::job::{JobTable, Jobs};
use crate::reaper::Reaper;

/// シェルの実行状態。REPLループ全体で共有される。
pub struct Shell {
    /// 直前のフォアグラウンドパイプライン（またはビルトイン）の終了ステータス。デバッグログ用。
    pub last_status: i32,
    /// ジョブテーブル。reaper スレッドと共有される。
    pub jobs: Jobs,
    pub limits: Limits,
    _reaper: Reaper,
}

impl Shell {
    /// ジョブテーブルを作り、reaper を起動する。
    ///
    /// reaper の起動失敗（SIGCHLD の受信登録失敗）はエラーとして返す。
    pub fn new(limits: Limits) -> io::Result<Self> {
        let jobs = Jobs::new(JobTable::new(
            limits.max_jobs,
            limits.max_line.saturating_sub(1),
        ));
        let reaper = Reaper::spawn(jobs.clone())?;
        Ok(Self {
            last_status: 0,
            jobs,
            limits,
            _reaper: reaper,
        })
    }
}

/// `sig` を無視する。失敗時のエラーにはシグナル名を含める。
pub fn ignore_signal(sig: c_int, name: &str) -> io::Result<()> {
    if unsafe { libc::signal(sig, libc::SIG_IGN) } == libc::SIG_ERR {
        let err = io::Error::last_os_error();
        return Err(io::Error::new(err.kind(), format!("signal {}: {}", name, err)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawn::JOB_SIGNALS;

    #[test]
    fn job_signals_are_ignored() {
        for (sig, name) in JOB_SIGNALS {
            ignore_signal(sig, name).unwrap();
            let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
            unsafe { libc::sigaction(sig, std::ptr::null(), &mut current) };
            assert_eq!(current.sa_sigaction, libc::SIG_IGN);
        }
    }

    #[test]
    fn uncatchable_signal_reports_its_name() {
        let err = ignore_signal(libc::SIGKILL, "SIGKILL").unwrap_err();
        assert!(err.to_string().starts_with("signal SIGKILL: "), "{err}");
    }
}
