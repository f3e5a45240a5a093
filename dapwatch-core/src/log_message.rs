//! ログポイントのメッセージテンプレート
//!
//! `value = {x}` のように `{...}` で囲んだ部分をヒット時に評価して埋め込みます。
//! `\{` と `\}` はそのまま波括弧として出力されます。

use crate::error::WatchError;

/// テンプレートの断片
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSegment {
    /// そのまま出力する文字列
    Text(String),
    /// ヒット時に評価する式
    Expression(String),
}

/// パース済みのログメッセージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    segments: Vec<LogSegment>,
}

impl LogMessage {
    /// テンプレートをパースする
    pub fn parse(template: &str) -> Result<Self, WatchError> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '\\' if matches!(chars.peek(), Some('{') | Some('}')) => {
                    if let Some(escaped) = chars.next() {
                        text.push(escaped);
                    }
                }
                '{' => {
                    let mut expr = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        expr.push(c);
                    }
                    if !closed {
                        return Err(WatchError::condition(format!(
                            "invalid log message '{}': unterminated '{{'",
                            template
                        )));
                    }
                    let expr = expr.trim();
                    if expr.is_empty() {
                        return Err(WatchError::condition(format!(
                            "invalid log message '{}': empty expression",
                            template
                        )));
                    }
                    if !text.is_empty() {
                        segments.push(LogSegment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(LogSegment::Expression(expr.to_string()));
                }
                c => text.push(c),
            }
        }

        if !text.is_empty() {
            segments.push(LogSegment::Text(text));
        }

        Ok(Self { segments })
    }

    /// 断片を取得する
    pub fn segments(&self) -> &[LogSegment] {
        &self.segments
    }

    /// 評価器を使ってメッセージを組み立てる
    ///
    /// 評価に失敗した式は `<error: ...>` として埋め込みます。
    pub fn format<F>(&self, mut evaluate: F) -> String
    where
        F: FnMut(&str) -> Result<String, String>,
    {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                LogSegment::Text(t) => out.push_str(t),
                LogSegment::Expression(e) => match evaluate(e) {
                    Ok(value) => out.push_str(&value),
                    Err(err) => {
                        out.push_str("<error: ");
                        out.push_str(&err);
                        out.push('>');
                    }
                },
            }
        }
        out
    }
}
