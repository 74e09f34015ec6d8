//! Deterministic intent, entity and sentiment extraction.
//!
//! Everything here is pure: no I/O and no shared state, so it runs on every
//! conversational turn. Intent classification sits behind `IntentClassifier`
//! so a statistical model can replace the pattern rules without touching
//! callers.

use std::fmt;

use frontdesk_core::domain::conversation::{Entities, Intent, Sentiment, Urgency};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static EMERGENCY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(emergency|urgent|flood(ed|ing)?|burst|gas (leak|smell)|smell gas|fire|smoke|sparking|no heat|pipe (broke|burst)|broken pipe|water everywhere)\b",
    )
    .expect("emergency pattern compiles")
});
static HUMAN_REQUEST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b((speak|talk) (to|with) (a |an |the )?(person|human|someone|manager|owner|representative|agent|operator)|real person|human being|representative|operator|transfer me)\b",
    )
    .expect("human request pattern compiles")
});
static GREETING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\W*(hi|hello|hey|howdy|good (morning|afternoon|evening))\b")
        .expect("greeting pattern compiles")
});
static BOOKING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(appointment|schedule|book(ing)?|reschedule|come out|come by|send someone|availability|available (on|at|for))\b",
    )
    .expect("booking pattern compiles")
});
static SERVICE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(services?|do you (do|offer|fix|repair|install|handle|service)|can you (fix|repair|install|help with)|what do you (do|offer))\b",
    )
    .expect("service pattern compiles")
});
static PRICING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(price|prices|pricing|cost|costs|how much|quote|estimate|rates?|charge|fees?)\b")
        .expect("pricing pattern compiles")
});
static COMPLAINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(complain|complaint|unhappy|not happy|disappointed|terrible|awful|worst|refund|still broken|never showed)\b",
    )
    .expect("complaint pattern compiles")
});
static GOODBYE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(bye|goodbye|good bye|that'?s all|that is all|have a (good|nice|great) (day|one|night))\b")
        .expect("goodbye pattern compiles")
});

static PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\+?1[\s.-]?)?\(?\d{3}\)?[\s.-]?\d{3}[\s.-]?\d{4}\b").expect("phone pattern compiles")
});
static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("email pattern compiles")
});
static NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i:\bmy name is|\bi'm|\bi am|\bname's|\bthis is)\s+([A-Za-z][A-Za-z'-]+)(?:\s+([A-Z][a-z'-]+))?")
        .expect("name pattern compiles")
});
static TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(\d{1,2}(:\d{2})?\s?(am|pm|a\.m\.|p\.m\.)|\d{1,2}:\d{2}|noon|midnight|tonight|this (morning|afternoon|evening)|in the (morning|afternoon|evening))",
    )
    .expect("time pattern compiles")
});
static DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(day after tomorrow|today|tomorrow|this weekend|next week|((next|this) )?(monday|tuesday|wednesday|thursday|friday|saturday|sunday)|(jan(uary)?|feb(ruary)?|mar(ch)?|apr(il)?|may|june?|july?|aug(ust)?|sep(t(ember)?)?|oct(ober)?|nov(ember)?|dec(ember)?)\.? \d{1,2}(st|nd|rd|th)?|\d{1,2}/\d{1,2}(/\d{2,4})?)\b",
    )
    .expect("date pattern compiles")
});

const POSITIVE_WORDS: &[&str] = &[
    "great", "thanks", "thank", "good", "excellent", "happy", "appreciate", "wonderful",
    "perfect", "awesome", "love", "helpful", "amazing",
];
const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "awful", "angry", "upset", "frustrated", "disappointed", "unhappy",
    "worst", "horrible", "annoyed", "hate", "ridiculous", "useless",
];
const NOT_A_NAME: &[&str] = &[
    "a", "an", "the", "not", "so", "just", "here", "calling", "looking", "having", "interested",
    "trying", "wondering", "hoping", "glad", "sorry", "very", "really", "still", "at", "in",
    "on", "about", "going", "getting", "sure", "fine", "good", "okay", "ok", "your",
    "my", "urgent", "emergency",
];

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntentMatch {
    pub intent: Intent,
    pub confidence: f32,
}

pub trait IntentClassifier: Send + Sync {
    fn classify(&self, utterance: &str) -> IntentMatch;
}

/// One `{predicate, label, confidence}` record of the rule table.
pub struct IntentRule {
    pub intent: Intent,
    pub confidence: f32,
    predicate: Box<dyn Fn(&str) -> bool + Send + Sync>,
}

impl IntentRule {
    pub fn new(
        intent: Intent,
        confidence: f32,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self { intent, confidence, predicate: Box::new(predicate) }
    }

    pub fn from_regex(intent: Intent, confidence: f32, pattern: &'static Lazy<Regex>) -> Self {
        Self::new(intent, confidence, move |text| pattern.is_match(text))
    }

    pub fn matches(&self, utterance: &str) -> bool {
        (self.predicate)(utterance)
    }
}

impl fmt::Debug for IntentRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntentRule")
            .field("intent", &self.intent)
            .field("confidence", &self.confidence)
            .finish_non_exhaustive()
    }
}

/// First matching rule wins; nothing matching yields the fallback.
#[derive(Debug)]
pub struct PatternIntentClassifier {
    rules: Vec<IntentRule>,
    fallback: IntentMatch,
}

impl PatternIntentClassifier {
    pub fn new(rules: Vec<IntentRule>, fallback: IntentMatch) -> Self {
        Self { rules, fallback }
    }

    /// Emergency is evaluated first so it beats every other label.
    pub fn default_rules() -> Vec<IntentRule> {
        vec![
            IntentRule::from_regex(Intent::Emergency, 0.95, &EMERGENCY),
            IntentRule::from_regex(Intent::HumanRequest, 0.9, &HUMAN_REQUEST),
            IntentRule::new(Intent::Greeting, 0.8, |text| {
                GREETING.is_match(text) && text.split_whitespace().count() <= 6
            }),
            IntentRule::from_regex(Intent::AppointmentBooking, 0.9, &BOOKING),
            IntentRule::from_regex(Intent::ServiceInquiry, 0.8, &SERVICE),
            IntentRule::from_regex(Intent::PricingInquiry, 0.85, &PRICING),
            IntentRule::from_regex(Intent::Complaint, 0.75, &COMPLAINT),
            IntentRule::from_regex(Intent::Goodbye, 0.8, &GOODBYE),
        ]
    }

    pub fn rules(&self) -> &[IntentRule] {
        &self.rules
    }
}

impl Default for PatternIntentClassifier {
    fn default() -> Self {
        Self::new(
            Self::default_rules(),
            IntentMatch { intent: Intent::InformationRequest, confidence: 0.5 },
        )
    }
}

impl IntentClassifier for PatternIntentClassifier {
    fn classify(&self, utterance: &str) -> IntentMatch {
        self.rules
            .iter()
            .find(|rule| rule.matches(utterance))
            .map(|rule| IntentMatch { intent: rule.intent, confidence: rule.confidence })
            .unwrap_or(self.fallback)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub intent: Intent,
    pub confidence: f32,
    pub entities: Entities,
    pub sentiment: Sentiment,
    pub urgency: Urgency,
}

pub struct Extractor {
    classifier: Box<dyn IntentClassifier>,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(Box::new(PatternIntentClassifier::default()))
    }
}

impl Extractor {
    pub fn new(classifier: Box<dyn IntentClassifier>) -> Self {
        Self { classifier }
    }

    pub fn analyze(&self, utterance: &str) -> Analysis {
        let IntentMatch { intent, confidence } = self.classifier.classify(utterance);
        let entities = extract_entities(utterance);
        let sentiment = score_sentiment(utterance);
        let urgency = derive_urgency(intent, sentiment);

        Analysis { intent, confidence, entities, sentiment, urgency }
    }
}

pub fn extract_entities(utterance: &str) -> Entities {
    let mut entities = Entities::new();

    if let Some(email) = EMAIL.find(utterance) {
        entities.insert("email".to_string(), email.as_str().to_ascii_lowercase());
    }
    if let Some(phone) = PHONE.find(utterance) {
        entities.insert("phone".to_string(), normalize_phone(phone.as_str()));
    }
    if let Some(name) = extract_name(utterance) {
        entities.insert("name".to_string(), name);
    }
    if let Some(time) = TIME.find(utterance) {
        entities.insert("time".to_string(), time.as_str().to_ascii_lowercase());
    }
    if let Some(date) = DATE.find(utterance) {
        entities.insert("date".to_string(), date.as_str().to_ascii_lowercase());
    }

    entities
}

/// Keyword vote; a tie is neutral.
pub fn score_sentiment(utterance: &str) -> Sentiment {
    let tokens = tokenize(&normalize_text(utterance));
    let positive = tokens.iter().filter(|token| POSITIVE_WORDS.contains(&token.as_str())).count();
    let negative = tokens.iter().filter(|token| NEGATIVE_WORDS.contains(&token.as_str())).count();

    match positive.cmp(&negative) {
        std::cmp::Ordering::Greater => Sentiment::Positive,
        std::cmp::Ordering::Less => Sentiment::Negative,
        std::cmp::Ordering::Equal => Sentiment::Neutral,
    }
}

pub fn derive_urgency(intent: Intent, sentiment: Sentiment) -> Urgency {
    match (intent, sentiment) {
        (Intent::Emergency, _) => Urgency::Critical,
        (Intent::Complaint, _) | (_, Sentiment::Negative) => Urgency::High,
        (Intent::AppointmentBooking, _) => Urgency::Medium,
        _ => Urgency::Low,
    }
}

fn extract_name(utterance: &str) -> Option<String> {
    NAME.captures_iter(utterance).find_map(|captures| {
        let first = captures.get(1)?.as_str();
        let lowered = first.to_ascii_lowercase();
        if NOT_A_NAME.contains(&lowered.as_str()) || lowered.ends_with("ing") {
            return None;
        }
        let mut name = title_case(first);
        if let Some(last) = captures.get(2) {
            let last_lowered = last.as_str().to_ascii_lowercase();
            if !NOT_A_NAME.contains(&last_lowered.as_str()) {
                name.push(' ');
                name.push_str(last.as_str());
            }
        }
        Some(name)
    })
}

fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    match digits.len() {
        10 => format!("+1{digits}"),
        11 if digits.starts_with('1') => format!("+{digits}"),
        _ => raw.trim().to_string(),
    }
}

fn title_case(word: &str) -> String {
    let mut characters = word.chars();
    match characters.next() {
        Some(first) => first.to_uppercase().chain(characters.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn normalize_text(text: &str) -> String {
    text.to_ascii_lowercase()
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|character: char| !character.is_ascii_alphanumeric() && character != '\'')
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
        .collect()
}
