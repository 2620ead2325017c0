//! トークナイザ + リダイレクトパーサー: 入力行をパイプライン段に分割し、各段を argv と
//! リダイレクト指定に変換する。
//!
//! 全トークンは入力行の部分文字列（`&str`）を借用するゼロコピー実装。
//!
//! ## 対応構文
//!
//! - パイプライン: `cmd1 | cmd2 | cmd3`
//! - リダイレクト: `<`, `>`, `>>`（単独トークン `> out` とファイル名連結 `>out` の両方）
//! - バックグラウンド実行: 行末の `&`（パイプライン全体が対象）
//!
//! クォート・変数展開・glob はサポートしない。

use thiserror::Error;
use tracing::warn;

// ── AST ─────────────────────────────────────────────────────────────

/// `|` で分割された 1 行。各段はトリム済みの部分文字列。
#[derive(Debug, PartialEq)]
pub struct PipelineLine<'a> {
    pub stages: Vec<&'a str>,
    /// 行末に `&` が指定された場合に `true`。
    pub background: bool,
    /// 段数上限を超えて捨てた段の数。
    pub dropped_stages: usize,
}

/// 1 段分のパース結果。spawn が終わるまでの一時的な値。
#[derive(Debug, PartialEq, Default)]
pub struct Stage<'a> {
    pub args: Vec<&'a str>,
    /// `<` の対象。複数指定時は最後の指定が有効。
    pub input: Option<&'a str>,
    /// `>` / `>>` の対象。複数指定時は最後の指定が有効。
    pub output: Option<OutputTarget<'a>>,
}

/// stdout リダイレクト先。
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct OutputTarget<'a> {
    pub path: &'a str,
    /// `>>` なら `true`（追記）、`>` なら `false`（切り詰め）。
    pub append: bool,
}

// ── Error ───────────────────────────────────────────────────────────

/// パース時に発生しうるエラー。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("syntax error: missing input file")]
    MissingInputFile,
    #[error("syntax error: missing output file")]
    MissingOutputFile,
    #[error("syntax error: too many pipeline stages (max {max})")]
    TooManyStages { max: usize },
    #[error("line too long (max {max} bytes)")]
    LineTooLong { max: usize },
}

// ── Tokenizer (crate-private) ───────────────────────────────────────

#[derive(Debug, PartialEq, Clone, Copy)]
enum RedirectKind {
    Input,  // <
    Output, // >
    Append, // >>
}

/// トークナイザが生成する内部トークン型。
#[derive(Debug, PartialEq)]
enum Token<'a> {
    Word(&'a str),
    /// `attached` は `>out` のように演算子に連結されたファイル名。
    Redirect {
        kind: RedirectKind,
        attached: Option<&'a str>,
    },
}

/// 段文字列を空白区切りでトークン列に変換するイテレータ。
struct Tokenizer<'a> {
    words: std::str::SplitAsciiWhitespace<'a>,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            words: input.split_ascii_whitespace(),
        }
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let word = self.words.next()?;
        // `>>` を `>` より先に判定する
        let (kind, rest) = if let Some(rest) = word.strip_prefix(">>") {
            (RedirectKind::Append, rest)
        } else if let Some(rest) = word.strip_prefix('>') {
            (RedirectKind::Output, rest)
        } else if let Some(rest) = word.strip_prefix('<') {
            (RedirectKind::Input, rest)
        } else {
            return Some(Token::Word(word));
        };
        let attached = (!rest.is_empty()).then_some(rest);
        Some(Token::Redirect { kind, attached })
    }
}

// ── Parser ──────────────────────────────────────────────────────────

/// 行を背景マーカーとパイプ区切りで分割する。
///
/// - 末尾の空白を除去してから `&` を 1 つ取り除き、残りの末尾空白も除去する
/// - `|` で分割し、長さ 0 の区間は捨てる（隣接する `||` は 1 区切り扱い）
/// - 各段は前後の空白をトリムする。空白のみの段は空の段として残る
/// - `max_commands` を超えた段は捨て、`dropped_stages` に数を記録する
pub fn split_pipeline(line: &str, max_commands: usize) -> PipelineLine<'_> {
    let trimmed = line.trim_end();
    let (body, background) = match trimmed.strip_suffix('&') {
        Some(rest) => (rest.trim_end(), true),
        None => (trimmed, false),
    };

    let mut stages = Vec::new();
    let mut dropped_stages = 0;
    for segment in body.split('|').filter(|s| !s.is_empty()) {
        if stages.len() < max_commands {
            stages.push(segment.trim());
        } else {
            dropped_stages += 1;
        }
    }

    PipelineLine {
        stages,
        background,
        dropped_stages,
    }
}

/// 1 段をパースして argv とリダイレクト指定を返す。
///
/// `max_args` は NULL 終端分を含む argv スロット数。超過した引数は黙って捨てる。
/// argv が空（リダイレクトのみの段など）でも `Ok` を返す。実行可否は呼び出し側が判定する。
pub fn parse_stage(input: &str, max_args: usize) -> Result<Stage<'_>, ParseError> {
    let keep = max_args.saturating_sub(1);
    let mut tokens = Tokenizer::new(input);
    let mut stage = Stage::default();
    let mut dropped = 0usize;

    while let Some(token) = tokens.next() {
        match token {
            Token::Word(w) => {
                if stage.args.len() < keep {
                    stage.args.push(w);
                } else {
                    dropped += 1;
                }
            }
            Token::Redirect { kind, attached } => {
                // ファイル名は連結部分、なければ次のワードを取る
                let target = attached.or_else(|| tokens.words.next());
                match (kind, target) {
                    (RedirectKind::Input, Some(path)) => stage.input = Some(path),
                    (RedirectKind::Input, None) => return Err(ParseError::MissingInputFile),
                    (RedirectKind::Output | RedirectKind::Append, Some(path)) => {
                        stage.output = Some(OutputTarget {
                            path,
                            append: kind == RedirectKind::Append,
                        });
                    }
                    (_, None) => return Err(ParseError::MissingOutputFile),
                }
            }
        }
    }

    if dropped > 0 {
        warn!(dropped, max_args, "dropping arguments beyond limit");
    }
    Ok(stage)
}

/// 段の先頭ワードを返す（ビルトイン判定用）。
pub fn first_word(stage: &str) -> Option<&str> {
    stage.split_ascii_whitespace().next()
}
