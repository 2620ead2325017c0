//! 容量制限の設定。
//!
//! 設定ファイルは持たない。各上限のデフォルト値は [`Limits::default`] で、
//! `MINISH_MAX_*` 環境変数で上書きできる。不正値は警告ログを出してデフォルトを維持する。

use tracing::warn;

/// ログフィルタを指定する環境変数（`EnvFilter` 構文、例: `MINISH_LOG=debug`）。
pub const LOG_ENV: &str = "MINISH_LOG";

/// 入力・パイプライン・ジョブテーブルの容量上限。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// 1 行の最大バイト数。これ以上の長さの行は拒否する。
    pub max_line: usize,
    /// argv のスロット数（NULL 終端分を含む）。保持できる引数は `max_args - 1` 個。
    pub max_args: usize,
    /// ジョブテーブルの容量。
    pub max_jobs: usize,
    /// 1 行のパイプライン段数の上限。
    pub max_commands: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_line: 1024,
            max_args: 64,
            max_jobs: 10,
            max_commands: 10,
        }
    }
}

impl Limits {
    /// プロセス環境変数から上限を読み込む。
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 任意のキー検索関数から上限を読み込む。未設定のキーはデフォルト値を使う。
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            max_line: read_limit(&lookup, "MINISH_MAX_LINE", defaults.max_line, 1),
            max_args: read_limit(&lookup, "MINISH_MAX_ARGS", defaults.max_args, 2),
            max_jobs: read_limit(&lookup, "MINISH_MAX_JOBS", defaults.max_jobs, 1),
            max_commands: read_limit(&lookup, "MINISH_MAX_COMMANDS", defaults.max_commands, 1),
        }
    }
}

fn read_limit<F>(lookup: &F, key: &str, default: usize, min: usize) -> usize
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<usize>() {
        Ok(n) if n >= min => n,
        _ => {
            warn!(key, value = %raw, default, "ignoring invalid limit");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_capacities() {
        let l = Limits::default();
        assert_eq!(l.max_line, 1024);
        assert_eq!(l.max_args, 64);
        assert_eq!(l.max_jobs, 10);
        assert_eq!(l.max_commands, 10);
    }

    #[test]
    fn lookup_overrides_selected_limits() {
        let l = Limits::from_lookup(|k| match k {
            "MINISH_MAX_JOBS" => Some("3".to_string()),
            "MINISH_MAX_COMMANDS" => Some(" 4 ".to_string()),
            _ => None,
        });
        assert_eq!(l.max_jobs, 3);
        assert_eq!(l.max_commands, 4);
        assert_eq!(l.max_line, 1024);
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let l = Limits::from_lookup(|k| match k {
            "MINISH_MAX_JOBS" => Some("0".to_string()),
            "MINISH_MAX_LINE" => Some("lots".to_string()),
            "MINISH_MAX_ARGS" => Some("1".to_string()),
            _ => None,
        });
        assert_eq!(l, Limits::default());
    }
}
