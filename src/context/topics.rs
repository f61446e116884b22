//! Topic extraction over user turns
//!
//! A fixed category table; matching is a pure function of the text.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

/// Conversation topic categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Topic {
    Education,
    Technology,
    Work,
    Health,
    Food,
    Travel,
    Family,
    Entertainment,
    Shopping,
    Sports,
    Finance,
    Weather,
}

impl Topic {
    pub const ALL: [Self; 12] = [
        Self::Education,
        Self::Technology,
        Self::Work,
        Self::Health,
        Self::Food,
        Self::Travel,
        Self::Family,
        Self::Entertainment,
        Self::Shopping,
        Self::Sports,
        Self::Finance,
        Self::Weather,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Education => "education",
            Self::Technology => "technology",
            Self::Work => "work",
            Self::Health => "health",
            Self::Food => "food",
            Self::Travel => "travel",
            Self::Family => "family",
            Self::Entertainment => "entertainment",
            Self::Shopping => "shopping",
            Self::Sports => "sports",
            Self::Finance => "finance",
            Self::Weather => "weather",
        }
    }

    const fn keywords(self) -> &'static [&'static str] {
        match self {
            Self::Education => &[
                "school", "class", "classes", "exam", "exams", "test", "homework", "study",
                "studying", "teacher", "university", "college", "course", "lesson", "learn",
                "learning", "math", "science", "history",
            ],
            Self::Technology => &[
                "computer", "software", "code", "coding", "programming", "app", "internet",
                "phone", "laptop", "ai", "robot", "tech", "technology", "website", "gadget",
            ],
            Self::Work => &[
                "work", "job", "office", "boss", "meeting", "meetings", "project", "deadline",
                "career", "colleague", "coworker", "salary", "interview", "business",
            ],
            Self::Health => &[
                "health", "doctor", "sick", "ill", "medicine", "exercise", "workout", "sleep",
                "tired", "headache", "hospital", "diet", "pain", "fitness",
            ],
            Self::Food => &[
                "food", "eat", "eating", "cook", "cooking", "recipe", "dinner", "lunch",
                "breakfast", "restaurant", "pizza", "coffee", "hungry", "meal",
            ],
            Self::Travel => &[
                "travel", "trip", "vacation", "holiday", "flight", "airport", "hotel", "beach",
                "visit", "abroad", "passport", "journey", "tour",
            ],
            Self::Family => &[
                "family", "mom", "dad", "mother", "father", "sister", "brother", "parents",
                "kids", "children", "son", "daughter", "wife", "husband", "grandma", "grandpa",
            ],
            Self::Entertainment => &[
                "movie", "movies", "film", "music", "song", "songs", "game", "games", "show",
                "tv", "book", "books", "concert", "netflix", "series", "podcast",
            ],
            Self::Shopping => &[
                "shop", "shopping", "buy", "buying", "store", "mall", "price", "order",
                "purchase", "sale", "discount", "amazon",
            ],
            Self::Sports => &[
                "sport", "sports", "football", "soccer", "basketball", "tennis", "baseball",
                "match", "team", "gym", "running", "swim", "swimming",
            ],
            Self::Finance => &[
                "money", "bank", "budget", "invest", "investing", "stock", "stocks", "loan",
                "rent", "bills", "savings", "tax", "taxes",
            ],
            Self::Weather => &[
                "weather", "rain", "raining", "sunny", "snow", "cold", "hot", "forecast",
                "temperature", "storm", "windy",
            ],
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

static TOPIC_PATTERNS: LazyLock<Vec<(Topic, Regex)>> = LazyLock::new(|| {
    Topic::ALL
        .iter()
        .map(|&topic| {
            let alternation = topic
                .keywords()
                .iter()
                .map(|k| regex::escape(k))
                .collect::<Vec<_>>()
                .join("|");
            let pattern = format!(r"(?i)\b(?:{alternation})\b");
            (topic, Regex::new(&pattern).expect("valid regex"))
        })
        .collect()
});

/// Categories mentioned in `text`
#[must_use]
pub fn extract_topics(text: &str) -> BTreeSet<Topic> {
    TOPIC_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(topic, _)| *topic)
        .collect()
}
