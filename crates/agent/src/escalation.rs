/// Outcome of screening one utterance before normal conversation handling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EscalationDecision {
    Continue,
    Emergency { keyword: String },
    Transfer { keyword: String },
}

impl EscalationDecision {
    pub fn transfer_reason(&self) -> Option<&'static str> {
        match self {
            Self::Continue => None,
            Self::Emergency { .. } => Some("emergency"),
            Self::Transfer { .. } => Some("customer_request"),
        }
    }

    pub fn should_transfer(&self) -> bool {
        !matches!(self, Self::Continue)
    }
}

/// Hard keyword screen applied to every caller turn. Emergency keywords are
/// always checked before transfer keywords.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub emergency_keywords: Vec<String>,
    pub transfer_keywords: Vec<String>,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        let owned = |words: &[&str]| -> Vec<String> { words.iter().map(|word| (*word).to_string()).collect() };
        Self {
            emergency_keywords: owned(&[
                "emergency",
                "urgent",
                "flood",
                "flooding",
                "flooded",
                "burst pipe",
                "pipe burst",
                "pipe broke",
                "gas leak",
                "smell gas",
                "fire",
                "smoke",
                "sparking",
                "no heat",
                "water everywhere",
            ]),
            transfer_keywords: owned(&[
                "speak to someone",
                "speak to a person",
                "speak with someone",
                "talk to someone",
                "talk to a person",
                "real person",
                "human",
                "representative",
                "operator",
                "manager",
                "transfer me",
            ]),
        }
    }
}

impl EscalationPolicy {
    pub fn evaluate(&self, utterance: &str) -> EscalationDecision {
        let normalized = normalize(utterance);

        if let Some(keyword) = find_keyword(&normalized, &self.emergency_keywords) {
            return EscalationDecision::Emergency { keyword };
        }
        if let Some(keyword) = find_keyword(&normalized, &self.transfer_keywords) {
            return EscalationDecision::Transfer { keyword };
        }
        EscalationDecision::Continue
    }
}

/// Lowercased words separated by single spaces, padded on both ends so that
/// keywords only match whole words.
fn normalize(utterance: &str) -> String {
    let words: Vec<String> = utterance
        .split(|character: char| !character.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect();
    format!(" {} ", words.join(" "))
}

fn find_keyword(normalized: &str, keywords: &[String]) -> Option<String> {
    keywords
        .iter()
        .find(|keyword| normalized.contains(&format!(" {} ", keyword.to_lowercase())))
        .cloned()
}
