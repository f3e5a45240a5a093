//! ヒット条件（hitCondition）のパースと評価

use crate::error::WatchError;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// ヒット回数の比較演算子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitOperator {
    /// `== N` / `= N`
    Equal,
    /// `> N`
    Greater,
    /// `>= N`（演算子省略時も同じ）
    GreaterEqual,
    /// `< N`
    Less,
    /// `<= N`
    LessEqual,
    /// `% N`：N回ごと
    Modulo,
}

impl HitOperator {
    fn symbol(self) -> &'static str {
        match self {
            HitOperator::Equal => "==",
            HitOperator::Greater => ">",
            HitOperator::GreaterEqual => ">=",
            HitOperator::Less => "<",
            HitOperator::LessEqual => "<=",
            HitOperator::Modulo => "%",
        }
    }
}

/// パース済みのヒット条件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitCondition {
    pub op: HitOperator,
    pub count: u64,
}

fn hit_condition_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(>=|<=|==|=|>|<|%)?\s*(\d+)\s*$").expect("hit condition regex is valid")
    })
}

impl HitCondition {
    /// ヒット条件をパースする
    ///
    /// `N` は `>= N` として扱います（N回目以降のヒットで停止）。
    pub fn parse(input: &str) -> Result<Self, WatchError> {
        let caps = hit_condition_regex().captures(input).ok_or_else(|| {
            WatchError::condition(format!(
                "invalid hit condition '{}': expected an optional operator (>=, >, <=, <, ==, %) followed by a number",
                input.trim()
            ))
        })?;

        let op = match caps.get(1).map(|m| m.as_str()) {
            None | Some(">=") => HitOperator::GreaterEqual,
            Some("==") | Some("=") => HitOperator::Equal,
            Some(">") => HitOperator::Greater,
            Some("<") => HitOperator::Less,
            Some("<=") => HitOperator::LessEqual,
            Some("%") => HitOperator::Modulo,
            Some(other) => {
                return Err(WatchError::condition(format!("unknown hit condition operator '{}'", other)))
            }
        };

        let count = caps[2].parse::<u64>().map_err(|e| {
            WatchError::condition(format!("invalid hit count in '{}': {}", input.trim(), e))
        })?;

        if op == HitOperator::Modulo && count == 0 {
            return Err(WatchError::condition("invalid hit condition '% 0': modulus must be non-zero"));
        }

        Ok(Self { op, count })
    }

    /// `hits` 回目のヒットで停止すべきか
    pub fn is_satisfied(&self, hits: u64) -> bool {
        match self.op {
            HitOperator::Equal => hits == self.count,
            HitOperator::Greater => hits > self.count,
            HitOperator::GreaterEqual => hits >= self.count,
            HitOperator::Less => hits < self.count,
            HitOperator::LessEqual => hits <= self.count,
            HitOperator::Modulo => hits % self.count == 0,
        }
    }
}

impl FromStr for HitCondition {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for HitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op.symbol(), self.count)
    }
}
