//! コマンド実行: ビルトイン判定、パイプライン接続、リダイレクト適用、ジョブ登録、
//! フォアグラウンド待機。
//!
//! - [`execute`]: 1 行全体の入口。行長チェック → `|` 分割 → ビルトイン → パイプライン
//! - [`Orchestrator::run`]: 段ごとにパイプを作り、左から順に spawn して親側の端を閉じる
//!   - パイプは `O_CLOEXEC` 付きの [`OwnedFd`] で保持し、不要になった時点で drop して閉じる
//!   - 子に渡る fd は stdin/stdout に dup2 されたものだけ
//!   - spawn・ジョブ登録・監視登録は 1 つのクリティカルセクションで行う
//!   - foreground: spawn した全段の終了（またはいずれかの停止）まで待機
//!   - background: ジョブテーブルに登録して即座に返る

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;

use libc::pid_t;
use thiserror::Error;
use tracing::debug;

use crate::builtins;
use crate::config::Limits;
use crate::job::{ChildStatus, Jobs};
use crate::parser::{self, ParseError, Stage};
use crate::shell::Shell;
use crate::spawn;

/// 1 パイプラインの実行結果。
#[derive(Debug, Default, PartialEq)]
pub struct PipelineReport {
    /// 作成したパイプの数。
    pub pipes_created: usize,
    /// spawn に成功した段の PID（左から順）。
    pub spawned: Vec<pid_t>,
    pub background: bool,
    /// フォアグラウンド時、最終段の待機結果。
    pub status: Option<ChildStatus>,
    /// 最終段を起動できなかった場合の終了ステータス。
    pub failed_status: Option<i32>,
}

/// リダイレクト先ファイルを開けなかった。
#[derive(Debug, Error)]
#[error("{path}: {source}")]
pub struct RedirectError {
    path: String,
    source: io::Error,
}

/// 1 行を実行する。ビルトインまたは空行なら `None`。
///
/// `line` は改行を除いた入力行そのもので、ジョブの表示用コマンドにも使う。
pub fn execute(shell: &mut Shell, line: &str) -> Option<PipelineReport> {
    if line.len() >= shell.limits.max_line {
        eprintln!(
            "minish: {}",
            ParseError::LineTooLong {
                max: shell.limits.max_line
            }
        );
        return None;
    }

    let pipeline = parser::split_pipeline(line, shell.limits.max_commands);
    let first = pipeline.stages.first()?;
    if let Some(status) = builtins::try_exec(shell, first) {
        shell.last_status = status;
        return None;
    }

    if pipeline.dropped_stages > 0 {
        eprintln!(
            "minish: {}",
            ParseError::TooManyStages {
                max: shell.limits.max_commands
            }
        );
    }

    let orchestrator = Orchestrator {
        jobs: &shell.jobs,
        limits: &shell.limits,
        display: line,
        background: pipeline.background,
    };
    let report = orchestrator.run(&pipeline.stages);
    if let Some(status) = report.status {
        shell.last_status = status.exit_code();
    } else if let Some(code) = report.failed_status.filter(|_| !report.background) {
        shell.last_status = code;
    }
    Some(report)
}

// ── パイプ / リダイレクト ───────────────────────────────────────────

/// `O_CLOEXEC` 付きパイプ。両端とも drop で閉じる。
struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    fn new() -> io::Result<Self> {
        let mut fds = [-1i32; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // 所有権を先に移し、以降のエラーでも両端が閉じられるようにする
        let pipe = unsafe {
            Self {
                read: OwnedFd::from_raw_fd(fds[0]),
                write: OwnedFd::from_raw_fd(fds[1]),
            }
        };
        set_cloexec(pipe.read.as_raw_fd())?;
        set_cloexec(pipe.write.as_raw_fd())?;
        Ok(pipe)
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// 段のリダイレクト先として開いたファイル。spawn 後に drop して親側で閉じる。
struct RedirectFds {
    stdin: Option<File>,
    stdout: Option<File>,
}

impl RedirectFds {
    /// `<` は読み取り専用、`>` は作成+切り詰め、`>>` は作成+追記（いずれも 0644）で開く。
    fn open(stage: &Stage<'_>) -> Result<Self, RedirectError> {
        let stdin = match stage.input {
            Some(path) => Some(File::open(path).map_err(|source| RedirectError {
                path: path.to_string(),
                source,
            })?),
            None => None,
        };
        let stdout = match stage.output {
            Some(target) => {
                let mut options = OpenOptions::new();
                options.write(true).create(true).mode(0o644);
                if target.append {
                    options.append(true);
                } else {
                    options.truncate(true);
                }
                Some(options.open(target.path).map_err(|source| RedirectError {
                    path: target.path.to_string(),
                    source,
                })?)
            }
            None => None,
        };
        Ok(Self { stdin, stdout })
    }
}

// ── オーケストレータ ────────────────────────────────────────────────

/// 1 パイプライン分の spawn 文脈。
pub struct Orchestrator<'a> {
    pub jobs: &'a Jobs,
    pub limits: &'a Limits,
    /// ジョブテーブルに登録する表示用コマンド（入力行そのもの）。
    pub display: &'a str,
    /// `true` ならパイプライン全体をバックグラウンドで実行する。
    pub background: bool,
}

impl Orchestrator<'_> {
    /// トリム済みの段を左から順に spawn し、フォアグラウンドなら待機する。
    ///
    /// 処理の流れ:
    /// 1. 最終段以外はパイプを作り、書き込み端をこの段の stdout にする
    /// 2. 段をパース・spawn する。失敗した段はスキップし、残りの段は続行する
    /// 3. 親側で書き込み端と、この段が読んだ読み出し端を閉じ、読み出し端を次段の stdin にする
    /// 4. foreground → spawn した全段を待機して retire する
    pub fn run(&self, stages: &[&str]) -> PipelineReport {
        let mut report = PipelineReport {
            background: self.background,
            ..PipelineReport::default()
        };

        // None は本物の stdin を継承
        let mut stdin_src: Option<OwnedFd> = None;
        let n = stages.len();

        for (i, text) in stages.iter().enumerate() {
            let is_last = i + 1 == n;

            let (next_stdin, stdout_dst) = if is_last {
                (None, None)
            } else {
                match Pipe::new() {
                    Ok(pipe) => {
                        report.pipes_created += 1;
                        (Some(pipe.read), Some(pipe.write))
                    }
                    Err(e) => {
                        eprintln!("minish: pipe: {}", e);
                        break;
                    }
                }
            };

            let stdin = stdin_src.as_ref().map(AsRawFd::as_raw_fd);
            let stdout = stdout_dst.as_ref().map(AsRawFd::as_raw_fd);
            match self.spawn_stage(text, stdin, stdout, is_last) {
                Ok(pid) => report.spawned.push(pid),
                Err(code) if is_last => report.failed_status = Some(code),
                Err(_) => {}
            }

            // 書き込み端を閉じないと下流が EOF を受け取れない
            drop(stdout_dst);
            stdin_src = next_stdin;
        }
        drop(stdin_src);

        if !self.background && !report.spawned.is_empty() {
            let outcomes = self.jobs.wait_for_all(&report.spawned);
            let mut table = self.jobs.lock();
            for &(pid, status) in &outcomes {
                if status.is_terminated() {
                    table.retire(pid);
                } else if table.find_pid(pid).is_none() {
                    // テーブル外の停止プロセスは残さない
                    eprintln!("minish: {}: job list full, terminating stopped process", pid);
                    unsafe {
                        libc::kill(pid, libc::SIGTERM);
                        libc::kill(pid, libc::SIGCONT);
                    }
                }
            }
            report.status = outcomes
                .iter()
                .find(|(pid, _)| report.spawned.last() == Some(pid))
                .map(|&(_, status)| status);
            debug!(spawned = ?report.spawned, ?outcomes, "foreground pipeline finished");
        }

        report
    }

    /// 1 段を spawn してジョブテーブルに登録する。
    ///
    /// spawn しなかった段は、子が失敗した場合に相当する終了ステータスを `Err` で返す。
    /// 明示的なリダイレクトはパイプの端より優先する。
    fn spawn_stage(
        &self,
        text: &str,
        stdin: Option<RawFd>,
        stdout: Option<RawFd>,
        is_last: bool,
    ) -> Result<pid_t, i32> {
        let stage = parser::parse_stage(text, self.limits.max_args).map_err(|e| {
            eprintln!("minish: {}", e);
            2
        })?;
        if stage.args.is_empty() {
            debug!(stage = text, "nothing to execute");
            return Err(0);
        }

        let redirects = RedirectFds::open(&stage).map_err(|e| {
            eprintln!("minish: {}", e);
            1
        })?;
        let stdin = redirects.stdin.as_ref().map(AsRawFd::as_raw_fd).or(stdin);
        let stdout = redirects.stdout.as_ref().map(AsRawFd::as_raw_fd).or(stdout);

        // 最終段だけがバックグラウンドジョブ。前段は個別に待たないエントリとして登録する
        let background = self.background && is_last;

        // reaper は登録が終わるまでこの子を回収できない
        let mut table = self.jobs.lock();
        let pid = match spawn::spawn(&stage.args, stdin, stdout) {
            Ok(pid) => pid,
            Err(e) => {
                drop(table);
                eprintln!("minish: {}", e);
                return Err(e.exit_status());
            }
        };
        debug!(pid, args = ?stage.args, background, "spawned");

        if let Err(e) = table.register(pid, self.display, background) {
            eprintln!("minish: {}", e);
        }
        if !self.background {
            table.watch(pid);
        }
        Ok(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::OutputTarget;
    use std::io::Read;

    #[test]
    fn pipe_ends_are_close_on_exec() {
        let pipe = Pipe::new().unwrap();
        for fd in [pipe.read.as_raw_fd(), pipe.write.as_raw_fd()] {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert_ne!(flags & libc::FD_CLOEXEC, 0);
        }
    }

    #[test]
    fn redirect_output_truncates_then_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, "old contents\n").unwrap();
        let path_str = path.to_str().unwrap();

        let mut stage = Stage {
            args: vec!["x"],
            output: Some(OutputTarget {
                path: path_str,
                append: false,
            }),
            ..Stage::default()
        };
        let fds = RedirectFds::open(&stage).unwrap();
        assert!(fds.stdin.is_none());
        drop(fds);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        std::fs::write(&path, "keep\n").unwrap();
        stage.output = Some(OutputTarget {
            path: path_str,
            append: true,
        });
        {
            use std::io::Write;
            let mut fds = RedirectFds::open(&stage).unwrap();
            fds.stdout.as_mut().unwrap().write_all(b"more\n").unwrap();
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep\nmore\n");
    }

    #[test]
    fn redirect_input_reads_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.txt");
        std::fs::write(&path, "data").unwrap();
        let stage = Stage {
            args: vec!["sort"],
            input: path.to_str(),
            ..Stage::default()
        };
        let mut fds = RedirectFds::open(&stage).unwrap();
        let mut buf = String::new();
        fds.stdin
            .as_mut()
            .unwrap()
            .read_to_string(&mut buf)
            .unwrap();
        assert_eq!(buf, "data");
    }

    #[test]
    fn redirect_open_failure_names_the_path() {
        let stage = Stage {
            args: vec!["cat"],
            input: Some("/nonexistent/minish-in.txt"),
            ..Stage::default()
        };
        let err = RedirectFds::open(&stage).err().unwrap();
        assert!(err.to_string().starts_with("/nonexistent/minish-in.txt: "));
    }
}
