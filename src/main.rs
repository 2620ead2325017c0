//! minish: パイプライン・リダイレクト・ジョブ管理を備えた小さなコマンドインタプリタ
//!
//! コマンドループ: プロンプト表示 → stdin から 1 行読み取り → ビルトイン / パイプライン実行 → ループ
//!
//! 行編集・履歴・変数展開・glob・クォートは持たない。モジュール構成は `lib.rs` を参照。

use std::io::{self, BufRead, IsTerminal, Write};

use anyhow::Context;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use minish::config::{Limits, LOG_ENV};
use minish::executor;
use minish::shell::{self, Shell};
use minish::spawn::JOB_SIGNALS;

/// `MINISH_LOG` で指定されたフィルタで stderr 向けのログを有効にする。未指定なら無効。
fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("off"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    init_logging();

    // シグナル設定: シェル自体は SIGINT/SIGTSTP を無視する。
    // 子プロセスは posix_spawnattr の POSIX_SPAWN_SETSIGDEF で SIG_DFL にリセットされる。
    for (sig, name) in JOB_SIGNALS {
        if let Err(e) = shell::ignore_signal(sig, name) {
            eprintln!("minish: {}", e);
        }
    }

    let limits = Limits::from_env();
    debug!(?limits, "starting");
    // SIGCHLD の受信登録に失敗したら起動できない
    let mut shell = Shell::new(limits).context("cannot install SIGCHLD handler")?;

    let interactive = io::stdin().is_terminal();
    let mut stdin = io::stdin().lock();
    let mut buf = Vec::new();

    loop {
        if interactive {
            eprint!("minish> ");
            let _ = io::stderr().flush();
        }

        buf.clear();
        let n = stdin
            .read_until(b'\n', &mut buf)
            .context("failed to read from stdin")?;
        if n == 0 {
            // EOF (Ctrl+D): 正常終了
            if interactive {
                eprintln!();
            }
            break;
        }

        let text = String::from_utf8_lossy(&buf);
        let line = text.strip_suffix('\n').unwrap_or(&*text);
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }

        if let Some(report) = executor::execute(&mut shell, line) {
            debug!(?report, last_status = shell.last_status, "pipeline done");
        }
    }

    Ok(())
}
