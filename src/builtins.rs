//! ビルトインコマンドの実装。
//!
//! ビルトインは spawn を経由せずプロセス内で直接実行される。判定は 1 行目の段の
//! 先頭ワードだけで行い、パイプやリダイレクトには参加しない。
//! `try_exec()` が `Some(status)` を返せばビルトインとして処理済み、
//! `None` なら外部コマンドとして executor に委ねる。

use std::env;
use std::io;
use std::path::PathBuf;

use tracing::debug;

use crate::job::JobState;
use crate::parser;
use crate::shell::Shell;

/// ビルトインコマンドの実行を試みる。`stage` はパイプライン先頭の段。
///
/// 戻り値:
/// - `Some(status)`: ビルトインとして実行済み
/// - `None`: 該当するビルトインなし（外部コマンドとして実行すべき）
pub fn try_exec(shell: &mut Shell, stage: &str) -> Option<i32> {
    let name = parser::first_word(stage)?;
    let args: Vec<&str> = stage.split_ascii_whitespace().collect();
    match name {
        "exit" => builtin_exit(shell, &args),
        "cd" => Some(builtin_cd(&args)),
        "jobs" => Some(builtin_jobs(shell)),
        "fg" => Some(builtin_fg(shell, &args)),
        _ => None,
    }
}

/// `exit [N]`: 追跡中の全ジョブに SIGTERM を送り、シェルを終了する。
///
/// プログラム全体を終了してよいのはここだけ。N 省略時は 0。
fn builtin_exit(shell: &Shell, args: &[&str]) -> ! {
    let code = match args.get(1) {
        Some(arg) => arg.parse::<i32>().unwrap_or_else(|_| {
            eprintln!("minish: exit: {}: numeric argument required", arg);
            2
        }),
        None => 0,
    };

    let table = shell.jobs.lock();
    for job in table.list() {
        if unsafe { libc::kill(job.pid, libc::SIGTERM) } != 0 {
            debug!(pid = job.pid, error = %io::Error::last_os_error(), "kill SIGTERM failed");
        }
    }
    drop(table);

    eprintln!("Exiting mini-shell.");
    std::process::exit(code);
}

/// `cd [dir]`: シェル自身のカレントディレクトリを変更する。以降に spawn する段はこれを継承する。
///
/// 引数省略時は `$HOME`。失敗時はカレントディレクトリを変えずに 1 を返す。
fn builtin_cd(args: &[&str]) -> i32 {
    let target = match args.get(1) {
        Some(dir) => PathBuf::from(dir),
        None => match env::var_os("HOME") {
            Some(home) => PathBuf::from(home),
            None => {
                eprintln!("minish: cd: HOME not set");
                return 1;
            }
        },
    };

    match env::set_current_dir(&target) {
        Ok(()) => {
            debug!(dir = %target.display(), "changed directory");
            0
        }
        Err(e) => {
            eprintln!("minish: cd: {}: {}", target.display(), e);
            1
        }
    }
}

/// `jobs`: 追跡中のジョブを `[id] 状態 コマンド` 形式で一覧表示する。
fn builtin_jobs(shell: &Shell) -> i32 {
    let table = shell.jobs.lock();
    if table.is_empty() {
        eprintln!("no jobs");
        return 0;
    }
    for job in table.list() {
        eprintln!("[{}] {} {}", job.id, job.state, job.command);
    }
    0
}

/// `fg <job_id>`: ジョブに SIGCONT を送り、終了（または再停止）まで待機する。
///
/// `%N` 形式も受け付ける。reaper が先に回収して ESRCH になるのは無害な競合として無視する。
fn builtin_fg(shell: &Shell, args: &[&str]) -> i32 {
    let Some(arg) = args.get(1) else {
        eprintln!("minish: fg: usage: fg <job_id>");
        return 1;
    };

    // 検索と監視登録は同じロック内で行う。間に reaper が retire すると待機が空振りする
    let job = {
        let mut table = shell.jobs.lock();
        let found = arg
            .trim_start_matches('%')
            .parse::<usize>()
            .ok()
            .and_then(|id| table.find(id).cloned());
        match found {
            Some(job) => {
                table.watch(job.pid);
                table.set_state(job.pid, JobState::Running);
                job
            }
            None => {
                eprintln!("minish: fg: {}: no such job", arg);
                return 1;
            }
        }
    };

    eprintln!(
        "Bringing job [{}] ({}) to foreground: {}",
        job.id, job.pid, job.command
    );
    if unsafe { libc::kill(job.pid, libc::SIGCONT) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            eprintln!("minish: fg: kill SIGCONT: {}", err);
        }
    }

    let outcomes = shell.jobs.wait_for_all(&[job.pid]);
    let status = match outcomes.first() {
        Some(&(pid, status)) => {
            if status.is_terminated() {
                shell.jobs.lock().retire(pid);
            }
            status.exit_code()
        }
        None => 0,
    };
    debug!(id = job.id, pid = job.pid, status, "fg finished");
    status
}
