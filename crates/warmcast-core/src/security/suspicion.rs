//! Pattern-based content suspicion scoring.

use std::fmt;

use regex::Regex;

/// Same character repeated this many times in a row.
const REPEATED_CHAR_RUN: usize = 6;

/// Classes of suspicious content, in evaluation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PatternClass {
    RepeatedChars,
    ExclamationRun,
    QuestionRun,
    UppercaseRun,
    ShortLink,
    Mention,
    Advertising,
    MoneyLure,
    ChannelPromo,
}

impl PatternClass {
    pub const ALL: [PatternClass; 9] = [
        PatternClass::RepeatedChars,
        PatternClass::ExclamationRun,
        PatternClass::QuestionRun,
        PatternClass::UppercaseRun,
        PatternClass::ShortLink,
        PatternClass::Mention,
        PatternClass::Advertising,
        PatternClass::MoneyLure,
        PatternClass::ChannelPromo,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PatternClass::RepeatedChars => "repeated_chars",
            PatternClass::ExclamationRun => "exclamation_run",
            PatternClass::QuestionRun => "question_run",
            PatternClass::UppercaseRun => "uppercase_run",
            PatternClass::ShortLink => "short_link",
            PatternClass::Mention => "mention",
            PatternClass::Advertising => "advertising",
            PatternClass::MoneyLure => "money_lure",
            PatternClass::ChannelPromo => "channel_promo",
        }
    }
}

impl fmt::Display for PatternClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SuspicionScore {
    /// Distinct classes matched, in evaluation order.
    pub matched: Vec<PatternClass>,
}

impl SuspicionScore {
    /// Count of distinct classes matched.
    pub fn severity(&self) -> usize {
        self.matched.len()
    }
}

/// Deterministic content classifier. Holds only compiled patterns.
#[derive(Clone, Debug)]
pub struct SuspicionScorer {
    exclamation: Regex,
    question: Regex,
    uppercase: Regex,
    short_link: Regex,
    mention: Regex,
    advertising: Regex,
    money: Regex,
    channel: Regex,
}

impl Default for SuspicionScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl SuspicionScorer {
    pub fn new() -> Self {
        Self {
            exclamation: compile(r"!{3,}"),
            question: compile(r"\?{3,}"),
            uppercase: compile(r"[A-ZА-ЯЁ]{10,}"),
            short_link: compile(r"bit\.ly|tinyurl|t\.me/\w+"),
            mention: compile(r"@\w+"),
            advertising: compile(r"куп[иы]|продаж|скидк|акци|реклам|\bbuy\b|\bsale\b|discount|promo|advertis"),
            money: compile(r"деньги|доход|заработ|млн|тысяч|\bmoney\b|income|\bearn"),
            channel: compile(r"телеграм[- ]?канал|подписыва|subscribe|my channel"),
        }
    }

    pub fn score(&self, text: &str) -> SuspicionScore {
        let lower = text.to_lowercase();
        let matched = PatternClass::ALL
            .into_iter()
            .filter(|class| self.matches(*class, text, &lower))
            .collect();
        SuspicionScore { matched }
    }

    fn matches(&self, class: PatternClass, original: &str, lower: &str) -> bool {
        match class {
            PatternClass::RepeatedChars => has_repeated_run(lower, REPEATED_CHAR_RUN),
            PatternClass::ExclamationRun => self.exclamation.is_match(lower),
            PatternClass::QuestionRun => self.question.is_match(lower),
            // Case matters here, so look at the text as submitted.
            PatternClass::UppercaseRun => self.uppercase.is_match(original),
            PatternClass::ShortLink => self.short_link.is_match(lower),
            PatternClass::Mention => self.mention.is_match(lower),
            PatternClass::Advertising => self.advertising.is_match(lower),
            PatternClass::MoneyLure => self.money.is_match(lower),
            PatternClass::ChannelPromo => self.channel.is_match(lower),
        }
    }
}

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("valid regex")
}

/// Any non-newline char repeated at least `min_run` times consecutively.
fn has_repeated_run(text: &str, min_run: usize) -> bool {
    let mut prev: Option<char> = None;
    let mut run = 0usize;
    for c in text.chars() {
        if c == '\n' {
            prev = None;
            run = 0;
            continue;
        }
        if Some(c) == prev {
            run += 1;
        } else {
            prev = Some(c);
            run = 1;
        }
        if run >= min_run {
            return true;
        }
    }
    false
}
