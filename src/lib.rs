//! minish ライブラリ: テスト・ベンチマーク用にモジュールを公開する。
//!
//! バイナリ本体は `main.rs` のコマンドループ。
//! この `lib.rs` は `tests/` と `benches/bench_main.rs` から
//! パーサー・ジョブテーブル・spawn・executor に直接アクセスするために存在する。
//!
//! ## モジュール構成
//!
//! | モジュール | 役割 |
//! |-----------|------|
//! | [`config`] | 容量制限（行長、引数数、ジョブ数、パイプライン段数）と `MINISH_*` 環境変数による上書き |
//! | [`parser`] | 構文解析（パイプライン分割、`&`、リダイレクト `<` / `>` / `>>`） |
//! | [`job`] | ジョブテーブル（登録、retire、一覧、同期待機用の監視登録） |
//! | [`reaper`] | SIGCHLD 駆動の reaper スレッド（非ブロッキング回収、Done/Stopped 通知） |
//! | [`spawn`] | `posix_spawnp` ラッパー（stdin/stdout 差し替え、シグナルリセット） |
//! | [`executor`] | パイプライン実行（パイプ接続、リダイレクト、ジョブ登録、フォアグラウンド待機） |
//! | [`builtins`] | ビルトイン（`exit`, `cd`, `jobs`, `fg`） |
//! | [`shell`] | シェルの状態（ジョブテーブル、容量制限、reaper ハンドル） |

pub mod builtins;
pub mod config;
pub mod executor;
pub mod job;
pub mod parser;
pub mod reaper;
pub mod shell;
pub mod spawn;
