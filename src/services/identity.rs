//! 学生身份匹配

use crate::models::Identity;
use regex::Regex;
use std::sync::OnceLock;

/// 未匹配到花名册时使用的学生名
pub const UNKNOWN_STUDENT: &str = "unknown";

fn header_regex() -> &'static Regex {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    HEADER.get_or_init(|| {
        Regex::new(r"(?mi)^\s*(?:姓名|名字|name)\s*[:：]\s*(\S+)").expect("正则表达式有效")
    })
}

/// 按花名册匹配作文作者
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    roster: Vec<String>,
}

impl IdentityResolver {
    pub fn new(roster: Vec<String>) -> Self {
        let roster = roster
            .into_iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        Self { roster }
    }

    /// 从文本中找出的候选姓名：`姓名:` 行优先，否则取第一个非空行
    pub fn candidate(text: &str) -> Option<String> {
        if let Some(captures) = header_regex().captures(text) {
            return captures.get(1).map(|m| m.as_str().to_string());
        }
        text.lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }

    /// 匹配身份
    ///
    /// 花名册为空时直接采用候选姓名（标记为未匹配）；
    /// 否则候选中包含花名册里的名字才算匹配，找不到时记为 `unknown`。
    pub fn resolve(&self, text: &str) -> Identity {
        let candidate = Self::candidate(text);

        if self.roster.is_empty() {
            return Identity {
                student: candidate.unwrap_or_else(|| UNKNOWN_STUDENT.to_string()),
                matched: false,
            };
        }

        let found = candidate.as_deref().and_then(|c| {
            // 名字越长越具体，避免 "王芳" 被 "王" 抢先匹配
            let mut names: Vec<&String> = self.roster.iter().collect();
            names.sort_by_key(|name| std::cmp::Reverse(name.chars().count()));
            names.into_iter().find(|name| c.contains(name.as_str()))
        });

        match found {
            Some(name) => Identity {
                student: name.clone(),
                matched: true,
            },
            None => Identity {
                student: UNKNOWN_STUDENT.to_string(),
                matched: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(vec!["王".into(), "王芳".into(), "李雷".into()])
    }

    #[test]
    fn test_header_line_wins() {
        let identity = resolver().resolve("我的暑假\n姓名：李雷\n今天天气很好");
        assert_eq!(identity.student, "李雷");
        assert!(identity.matched);
    }

    #[test]
    fn test_first_line_fallback_prefers_longest_name() {
        let identity = resolver().resolve("\n  三年二班 王芳\n正文");
        assert_eq!(identity.student, "王芳");
    }

    #[test]
    fn test_unmatched_is_unknown() {
        let identity = resolver().resolve("Name: Tom\n...");
        assert_eq!(identity.student, UNKNOWN_STUDENT);
        assert!(!identity.matched);
    }

    #[test]
    fn test_empty_roster_keeps_candidate() {
        let identity = IdentityResolver::default().resolve("name: Alice");
        assert_eq!(identity.student, "Alice");
        assert!(!identity.matched);
    }
}
