//! ジョブテーブルと同期待機ヘルパー。
//!
//! [`JobTable`] は固定容量のスロット配列で、spawn したプロセスを 1 スロット 1 プロセスで管理する。
//! メインスレッド（executor / builtins）と reaper スレッドの両方から変更されるため、
//! 必ず [`Jobs`] 経由で mutex を取ってから走査・変更する。
//!
//! 同期待機（フォアグラウンド・`fg`）は `waitpid` を直接呼ばない。待機したい PID を
//! [`JobTable::watch`] で登録し、reaper が [`JobTable::record`] で状態を書き込むのを
//! [`Jobs::wait_for_all`] で condvar 越しに待つ。`waitpid` を呼ぶのは reaper だけ。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use libc::pid_t;
use thiserror::Error;

// ── データ構造 ───────────────────────────────────────────────────────

/// ジョブのライフサイクル状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Stopped,
    /// 終了を観測した瞬間だけの状態。この状態になったジョブは既にテーブルから外れている。
    Done,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Done => "Done",
        })
    }
}

/// `waitpid` が報告した子プロセスの状態変化。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    /// 正常終了。引数は終了コード。
    Exited(i32),
    /// シグナルで終了。引数はシグナル番号。
    Signaled(i32),
    /// 停止。引数は停止シグナル番号。
    Stopped(i32),
}

impl ChildStatus {
    /// `waitpid` の raw status を解釈する。再開通知など対象外の状態は `None`。
    pub fn from_raw(raw: i32) -> Option<Self> {
        if libc::WIFEXITED(raw) {
            Some(Self::Exited(libc::WEXITSTATUS(raw)))
        } else if libc::WIFSIGNALED(raw) {
            Some(Self::Signaled(libc::WTERMSIG(raw)))
        } else if libc::WIFSTOPPED(raw) {
            Some(Self::Stopped(libc::WSTOPSIG(raw)))
        } else {
            None
        }
    }

    /// プロセスがもう存在しない（終了またはシグナル死）なら `true`。
    pub fn is_terminated(self) -> bool {
        !matches!(self, Self::Stopped(_))
    }

    /// シェル慣習の終了ステータス（シグナルは 128 + N）。
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(sig) | Self::Stopped(sig) => 128 + sig,
        }
    }
}

/// 追跡中のプロセス 1 つ。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub pid: pid_t,
    /// `[N]` 形式で表示されるジョブ番号。単調増加で再利用しない。
    pub id: usize,
    /// ユーザが入力した行そのもの（段ごとの argv ではない）。
    pub command: String,
    pub state: JobState,
    /// `true` のジョブだけが完了時に Done 通知される。
    pub background: bool,
}

/// reaper が stderr に出すジョブ状態通知。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Done(Job),
    Stopped(Job),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let job = match self {
            Self::Done(job) | Self::Stopped(job) => job,
        };
        write!(
            f,
            "Job [{}] ({}) {}: {}",
            job.id, job.pid, job.state, job.command
        )
    }
}

/// ジョブテーブル操作のエラー。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job list full (max {capacity} jobs)")]
    TableFull { capacity: usize },
    #[error("process {pid} is already tracked")]
    AlreadyTracked { pid: pid_t },
}

// ── JobTable ─────────────────────────────────────────────────────────

/// 固定容量のジョブテーブル。
pub struct JobTable {
    slots: Vec<Option<Job>>,
    next_id: usize,
    /// 表示用コマンド文字列の最大バイト数。
    max_command: usize,
    /// 同期待機中の PID → reaper が記録した最新状態（未観測なら `None`）。
    watched: HashMap<pid_t, Option<ChildStatus>>,
}

impl JobTable {
    pub fn new(capacity: usize, max_command: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            next_id: 1,
            max_command,
            watched: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 最初の空きスロットにプロセスを登録し、割り当てたジョブ ID を返す。
    ///
    /// バックグラウンドジョブは `[id] pid` を stderr に通知する。
    /// 空きがなければ [`JobError::TableFull`]。ID は消費しない。
    pub fn register(
        &mut self,
        pid: pid_t,
        command: &str,
        background: bool,
    ) -> Result<usize, JobError> {
        if self.slot_index(pid).is_some() {
            return Err(JobError::AlreadyTracked { pid });
        }
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(JobError::TableFull {
                capacity: self.capacity(),
            })?;

        let id = self.next_id;
        self.next_id += 1;
        self.slots[index] = Some(Job {
            pid,
            id,
            command: truncate_command(command, self.max_command),
            state: JobState::Running,
            background,
        });

        if background {
            eprintln!("[{}] {}", id, pid);
        }
        Ok(id)
    }

    /// `pid` のスロットを空ける。見つからなければ何もしない（二重 retire は無害）。
    pub fn retire(&mut self, pid: pid_t) -> Option<Job> {
        let index = self.slot_index(pid)?;
        self.slots[index].take()
    }

    /// ジョブ ID で検索する。
    pub fn find(&self, id: usize) -> Option<&Job> {
        self.list().find(|j| j.id == id)
    }

    /// PID で検索する。
    pub fn find_pid(&self, pid: pid_t) -> Option<&Job> {
        self.list().find(|j| j.pid == pid)
    }

    /// 使用中スロットをスロット順に列挙する。
    pub fn list(&self) -> impl Iterator<Item = &Job> {
        self.slots.iter().flatten()
    }

    /// ジョブの状態を更新する。該当 PID がなければ `false`。
    pub fn set_state(&mut self, pid: pid_t, state: JobState) -> bool {
        match self.slot_mut(pid) {
            Some(job) => {
                job.state = state;
                true
            }
            None => false,
        }
    }

    /// 同期待機の対象として `pid` を登録する。spawn と同じクリティカルセクション内で呼ぶこと。
    pub fn watch(&mut self, pid: pid_t) {
        self.watched.insert(pid, None);
    }

    /// 待機登録を外し、記録済みの状態があれば返す。
    pub fn unwatch(&mut self, pid: pid_t) -> Option<ChildStatus> {
        self.watched.remove(&pid).flatten()
    }

    pub fn is_watched(&self, pid: pid_t) -> bool {
        self.watched.contains_key(&pid)
    }

    /// reaper が観測した状態変化を反映し、出すべき通知を返す。
    ///
    /// - 終了: スロットを空ける。バックグラウンドかつ同期待機されていなければ Done 通知
    /// - 停止: `Stopped` にしてバックグラウンド扱いに切り替え、常に Stopped 通知
    /// - テーブルにない PID: 待機登録があれば状態だけ記録する
    pub fn record(&mut self, pid: pid_t, status: ChildStatus) -> Option<Notice> {
        let held = match self.watched.get_mut(&pid) {
            Some(slot) => {
                *slot = Some(status);
                true
            }
            None => false,
        };

        if status.is_terminated() {
            let mut job = self.retire(pid)?;
            job.state = JobState::Done;
            (job.background && !held).then_some(Notice::Done(job))
        } else {
            let job = self.slot_mut(pid)?;
            job.state = JobState::Stopped;
            job.background = true;
            Some(Notice::Stopped(job.clone()))
        }
    }

    fn slot_index(&self, pid: pid_t) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|j| j.pid == pid))
    }

    fn slot_mut(&mut self, pid: pid_t) -> Option<&mut Job> {
        self.slots.iter_mut().flatten().find(|j| j.pid == pid)
    }
}

/// char 境界を保ったまま `max` バイト以下に切り詰める。
fn truncate_command(command: &str, max: usize) -> String {
    if command.len() <= max {
        return command.to_string();
    }
    let mut end = max;
    while !command.is_char_boundary(end) {
        end -= 1;
    }
    command[..end].to_string()
}

// ── 共有ハンドル ─────────────────────────────────────────────────────

struct Shared {
    table: Mutex<JobTable>,
    changed: Condvar,
}

/// メインスレッドと reaper で共有するジョブテーブルのハンドル。
#[derive(Clone)]
pub struct Jobs {
    shared: Arc<Shared>,
}

impl Jobs {
    pub fn new(table: JobTable) -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(table),
                changed: Condvar::new(),
            }),
        }
    }

    /// テーブルをロックする。ロック中は reaper が状態変化を反映できない。
    pub fn lock(&self) -> MutexGuard<'_, JobTable> {
        self.shared
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 同期待機中のスレッドを起こす。reaper が 1 回の回収ループの後に呼ぶ。
    pub fn notify_changed(&self) {
        self.shared.changed.notify_all();
    }

    /// 監視中の `pids` がすべて終了するか、いずれかが停止するまでブロックする。
    ///
    /// 戻り値は状態を観測できた PID とその状態。待機登録はすべて外す。
    /// 監視登録されていない PID は待たない。
    pub fn wait_for_all(&self, pids: &[pid_t]) -> Vec<(pid_t, ChildStatus)> {
        let mut table = self.lock();
        loop {
            let mut pending = false;
            let mut stopped = false;
            for pid in pids {
                match table.watched.get(pid) {
                    Some(None) => pending = true,
                    Some(Some(status)) => stopped |= !status.is_terminated(),
                    None => {}
                }
            }
            if stopped || !pending {
                break;
            }
            table = self
                .shared
                .changed
                .wait(table)
                .unwrap_or_else(PoisonError::into_inner);
        }
        pids.iter()
            .filter_map(|&pid| table.unwatch(pid).map(|status| (pid, status)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn table() -> JobTable {
        JobTable::new(3, 1023)
    }

    #[test]
    fn register_assigns_increasing_ids() {
        let mut t = table();
        assert_eq!(t.register(100, "sleep 5 &", true), Ok(1));
        assert_eq!(t.register(101, "sleep 6 &", true), Ok(2));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn ids_are_not_reused_after_retire() {
        let mut t = table();
        t.register(100, "a", false).unwrap();
        t.retire(100);
        assert_eq!(t.register(101, "b", false), Ok(2));
    }

    #[test]
    fn full_table_rejects_new_job() {
        let mut t = table();
        for pid in 1..=3 {
            t.register(pid, "x", false).unwrap();
        }
        assert_eq!(
            t.register(4, "x", false),
            Err(JobError::TableFull { capacity: 3 })
        );
        assert!(t.find_pid(4).is_none());
        assert_eq!(
            t.register(4, "x", false).unwrap_err().to_string(),
            "job list full (max 3 jobs)"
        );
    }

    #[test]
    fn full_table_does_not_consume_ids() {
        let mut t = JobTable::new(1, 1023);
        t.register(1, "x", false).unwrap();
        assert!(t.register(2, "y", false).is_err());
        t.retire(1);
        assert_eq!(t.register(2, "y", false), Ok(2));
    }

    #[test]
    fn duplicate_pid_is_rejected() {
        let mut t = table();
        t.register(7, "x", false).unwrap();
        assert_eq!(
            t.register(7, "x", false),
            Err(JobError::AlreadyTracked { pid: 7 })
        );
    }

    #[test]
    fn freed_slot_is_reused_first() {
        let mut t = table();
        t.register(10, "a", false).unwrap();
        t.register(11, "b", false).unwrap();
        t.retire(10);
        t.register(12, "c", false).unwrap();
        let pids: Vec<pid_t> = t.list().map(|j| j.pid).collect();
        assert_eq!(pids, vec![12, 11]);
    }

    #[test]
    fn retire_twice_is_harmless() {
        let mut t = table();
        t.register(10, "a", true).unwrap();
        assert!(t.retire(10).is_some());
        assert!(t.retire(10).is_none());
        assert!(t.is_empty());
    }

    #[test]
    fn find_by_job_id() {
        let mut t = table();
        t.register(10, "a", true).unwrap();
        t.register(11, "b", true).unwrap();
        assert_eq!(t.find(2).map(|j| j.pid), Some(11));
        assert!(t.find(3).is_none());
    }

    #[test]
    fn command_is_truncated_on_char_boundary() {
        let mut t = JobTable::new(1, 4);
        t.register(1, "aéé", false).unwrap();
        assert_eq!(t.find(1).unwrap().command, "aé");
    }

    #[test]
    fn record_exit_of_background_job_announces_done() {
        let mut t = table();
        t.register(10, "sleep 1 &", true).unwrap();
        let notice = t.record(10, ChildStatus::Exited(0)).unwrap();
        assert_eq!(notice.to_string(), "Job [1] (10) Done: sleep 1 &");
        assert!(t.is_empty());
    }

    #[test]
    fn record_exit_of_foreground_job_is_silent() {
        let mut t = table();
        t.register(10, "ls", false).unwrap();
        assert_eq!(t.record(10, ChildStatus::Signaled(9)), None);
        assert!(t.is_empty());
    }

    #[test]
    fn record_exit_of_watched_background_job_is_silent() {
        let mut t = table();
        t.register(10, "sleep 1 &", true).unwrap();
        t.watch(10);
        assert_eq!(t.record(10, ChildStatus::Exited(0)), None);
        assert_eq!(t.unwatch(10), Some(ChildStatus::Exited(0)));
    }

    #[test]
    fn record_stop_keeps_job_and_promotes_to_background() {
        let mut t = table();
        t.register(10, "vim", false).unwrap();
        let notice = t.record(10, ChildStatus::Stopped(libc::SIGTSTP)).unwrap();
        assert_eq!(notice.to_string(), "Job [1] (10) Stopped: vim");
        let job = t.find(1).unwrap();
        assert_eq!(job.state, JobState::Stopped);
        assert!(job.background);
        // 停止後の終了は Done 通知される
        assert!(matches!(
            t.record(10, ChildStatus::Exited(0)),
            Some(Notice::Done(_))
        ));
    }

    #[test]
    fn record_unknown_pid_is_ignored() {
        let mut t = table();
        assert_eq!(t.record(99, ChildStatus::Exited(0)), None);
        assert_eq!(t.record(99, ChildStatus::Stopped(19)), None);
    }

    #[test]
    fn record_untracked_watched_pid_keeps_status() {
        let mut t = table();
        t.watch(99);
        t.record(99, ChildStatus::Exited(3));
        assert_eq!(t.unwatch(99), Some(ChildStatus::Exited(3)));
        assert!(!t.is_watched(99));
    }

    #[test]
    fn child_status_exit_codes() {
        assert_eq!(ChildStatus::Exited(3).exit_code(), 3);
        assert_eq!(ChildStatus::Signaled(libc::SIGTERM).exit_code(), 128 + libc::SIGTERM);
        assert!(ChildStatus::Signaled(9).is_terminated());
        assert!(!ChildStatus::Stopped(19).is_terminated());
    }

    #[test]
    fn wait_for_all_sees_status_recorded_by_other_thread() {
        let jobs = Jobs::new(table());
        {
            let mut t = jobs.lock();
            t.register(10, "a | b", false).unwrap();
            t.register(11, "a | b", false).unwrap();
            t.watch(10);
            t.watch(11);
        }
        let reaper = jobs.clone();
        let handle = thread::spawn(move || {
            for pid in [11, 10] {
                thread::sleep(Duration::from_millis(20));
                reaper.lock().record(pid, ChildStatus::Exited(0));
                reaper.notify_changed();
            }
        });
        let outcomes = jobs.wait_for_all(&[10, 11]);
        handle.join().unwrap();
        assert_eq!(outcomes, vec![(10, ChildStatus::Exited(0)), (11, ChildStatus::Exited(0))]);
        assert!(jobs.lock().is_empty());
    }

    #[test]
    fn wait_for_all_returns_early_on_stop() {
        let jobs = Jobs::new(table());
        {
            let mut t = jobs.lock();
            t.register(10, "a | b", false).unwrap();
            t.register(11, "a | b", false).unwrap();
            t.watch(10);
            t.watch(11);
            t.record(11, ChildStatus::Stopped(libc::SIGTSTP));
        }
        let outcomes = jobs.wait_for_all(&[10, 11]);
        assert_eq!(outcomes, vec![(11, ChildStatus::Stopped(libc::SIGTSTP))]);
        let t = jobs.lock();
        assert!(!t.is_watched(10));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn wait_for_all_skips_unwatched_pids() {
        let jobs = Jobs::new(table());
        assert!(jobs.wait_for_all(&[42]).is_empty());
    }
}
