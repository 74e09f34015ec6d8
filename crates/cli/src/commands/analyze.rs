use crate::commands::CommandResult;
use frontdesk_agent::Extractor;

pub fn run(utterance: &str) -> CommandResult {
    let utterance = utterance.trim();
    if utterance.is_empty() {
        return CommandResult::failure("analyze", "invalid_input", "utterance must not be empty", 2);
    }

    let analysis = Extractor::default().analyze(utterance);
    match serde_json::to_value(&analysis) {
        Ok(data) => CommandResult::success_with_data(
            "analyze",
            format!("classified as {}", analysis.intent.as_str()),
            Some(data),
        ),
        Err(error) => CommandResult::failure("analyze", "serialization", error.to_string(), 3),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::run;

    #[test]
    fn flooding_is_an_emergency() {
        let result = run("help, my basement is flooding");
        assert_eq!(result.exit_code, 0);

        let payload: Value = serde_json::from_str(&result.output).expect("json");
        assert_eq!(payload["data"]["intent"], "emergency");
        assert_eq!(payload["data"]["urgency"], "critical");
    }

    #[test]
    fn blank_utterances_are_rejected() {
        let result = run("   ");

        assert_eq!(result.exit_code, 2);
        let payload: Value = serde_json::from_str(&result.output).expect("json");
        assert_eq!(payload["error_class"], "invalid_input");
    }
}
