//! 响应合并
//!
//! 唯一成功：原样透传。多个成功：按主题小节拼接。
//! 全部失败：逐条列出主题与失败原因。
//! 成功失败混杂：成功部分照常呈现，失败的附在结尾。

/// 一个 Agent 的最终去向：成功带回复，失败带原因
#[derive(Debug, Clone)]
pub struct AgentRunRecord {
    pub agent_id: String,
    pub topic: String,
    pub outcome: Result<String, String>,
}

impl AgentRunRecord {
    pub fn succeeded(agent_id: impl Into<String>, topic: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            topic: topic.into(),
            outcome: Ok(response.into()),
        }
    }

    pub fn failed(agent_id: impl Into<String>, topic: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            topic: topic.into(),
            outcome: Err(error.into()),
        }
    }
}

pub fn merge_responses(records: &[AgentRunRecord]) -> String {
    let successes: Vec<(&str, &str)> = records
        .iter()
        .filter_map(|r| r.outcome.as_deref().ok().map(|resp| (r.topic.as_str(), resp)))
        .collect();
    let failures: Vec<(&str, &str)> = records
        .iter()
        .filter_map(|r| {
            r.outcome
                .as_ref()
                .err()
                .map(|e| (r.topic.as_str(), e.as_str()))
        })
        .collect();

    if successes.is_empty() {
        let mut lines = vec!["None of the tasks could be completed:".to_string()];
        for (topic, error) in &failures {
            lines.push(format!("- {}: {}", topic, error));
        }
        return lines.join("\n");
    }

    let mut merged = match successes.as_slice() {
        [(_, only)] => (*only).to_string(),
        many => many
            .iter()
            .map(|(topic, response)| format!("**{}**\n\n{}", topic, response))
            .collect::<Vec<_>>()
            .join("\n\n"),
    };

    if !failures.is_empty() {
        merged.push_str("\n\nSome tasks could not be completed:");
        for (topic, error) in &failures {
            merged.push_str(&format!("\n- {}: {}", topic, error));
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_success_verbatim() {
        let records = vec![AgentRunRecord::succeeded("agent_1", "research", "The answer is 42.")];
        assert_eq!(merge_responses(&records), "The answer is 42.");
    }

    #[test]
    fn test_multiple_successes_get_topic_sections() {
        let records = vec![
            AgentRunRecord::succeeded("agent_1", "research", "Found three options."),
            AgentRunRecord::succeeded("agent_2", "summary", "Option B wins."),
        ];
        let merged = merge_responses(&records);
        assert!(merged.starts_with("**research**\n\nFound three options."));
        assert!(merged.contains("**summary**\n\nOption B wins."));
    }

    #[test]
    fn test_all_failed_lists_each_error() {
        let records = vec![
            AgentRunRecord::failed("agent_1", "research", "stalled"),
            AgentRunRecord::failed("agent_2", "summary", "llm exploded"),
        ];
        let merged = merge_responses(&records);
        assert!(merged.starts_with("None of the tasks could be completed:"));
        assert!(merged.contains("- research: stalled"));
        assert!(merged.contains("- summary: llm exploded"));
    }

    #[test]
    fn test_mixed_appends_failures() {
        let records = vec![
            AgentRunRecord::succeeded("agent_1", "research", "Found it."),
            AgentRunRecord::failed("agent_2", "summary", "timed out"),
        ];
        let merged = merge_responses(&records);
        assert!(merged.starts_with("Found it."));
        assert!(merged.contains("- summary: timed out"));
    }
}
