use crate::types::KbEntry;

const DIRECT_ANSWER_THRESHOLD: f64 = 0.85;
const SUGGESTION_THRESHOLD: f64 = 0.5;
const KEYWORD_BOOST: f64 = 0.1;

#[derive(Debug, Clone)]
pub enum KbMatch {
    /// High-confidence hit, answered verbatim from the knowledge base.
    Answer(String),
    /// Medium-confidence hits, surfaced as a did-you-mean list.
    Suggestions(Vec<String>),
}

/// Knowledge-base lookup: normalized edit-distance similarity against each
/// stored question, boosted when configured keywords appear in the message.
pub fn match_knowledge_base(entries: &[KbEntry], text: &str) -> Option<KbMatch> {
    let mut scored = Vec::new();
    for entry in entries {
        let mut score = similarity(text, &entry.question);
        let lower = text.to_lowercase();
        let keyword_hits = entry
            .keywords
            .iter()
            .filter(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
            .count();
        if keyword_hits > 0 {
            score = (score + keyword_hits as f64 * KEYWORD_BOOST).min(1.0);
        }
        if score >= SUGGESTION_THRESHOLD {
            scored.push((score, entry));
        }
    }

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let (best_score, best) = scored.first().map(|(s, e)| (*s, *e))?;
    if best_score >= DIRECT_ANSWER_THRESHOLD {
        return Some(KbMatch::Answer(best.answer.clone()));
    }

    let suggestions = scored
        .iter()
        .take(3)
        .map(|(_, entry)| entry.question.clone())
        .collect();
    Some(KbMatch::Suggestions(suggestions))
}

pub fn suggestion_reply(suggestions: &[String]) -> String {
    let mut reply =
        String::from("I'm not sure I understood that exactly. Did you mean one of these?\n\n");
    for (index, question) in suggestions.iter().enumerate() {
        reply.push_str(&format!("{}. {}\n", index + 1, question));
    }
    reply.push_str("\nPlease rephrase your question or pick one of the above.");
    reply
}

/// Similarity in [0, 1]: 1 minus the edit distance over the longer length.
fn similarity(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let (longer, shorter) = if a.chars().count() >= b.chars().count() {
        (&a, &b)
    } else {
        (&b, &a)
    };
    let longer_len = longer.chars().count();
    if longer_len == 0 {
        return 1.0;
    }
    let distance = levenshtein(longer, shorter);
    (longer_len - distance) as f64 / longer_len as f64
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(question: &str, answer: &str, keywords: &[&str]) -> KbEntry {
        KbEntry {
            id: question.to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn exact_question_answers_directly() {
        let entries = vec![entry(
            "What are your opening hours?",
            "We are open 9-5 Monday to Friday.",
            &[],
        )];
        match match_knowledge_base(&entries, "What are your opening hours?") {
            Some(KbMatch::Answer(answer)) => {
                assert_eq!(answer, "We are open 9-5 Monday to Friday.")
            }
            other => panic!("expected direct answer, got {other:?}"),
        }
    }

    #[test]
    fn near_miss_returns_suggestions() {
        let entries = vec![
            entry("What are your opening hours?", "9-5 weekdays.", &[]),
            entry("Where are you located?", "Downtown.", &[]),
        ];
        match match_knowledge_base(&entries, "what are your openin hours on sunday") {
            Some(KbMatch::Suggestions(suggestions)) => {
                assert!(!suggestions.is_empty());
                assert_eq!(suggestions[0], "What are your opening hours?");
            }
            other => panic!("expected suggestions, got {other:?}"),
        }
    }

    #[test]
    fn unrelated_text_matches_nothing() {
        let entries = vec![entry("What are your opening hours?", "9-5 weekdays.", &[])];
        assert!(match_knowledge_base(&entries, "tell me a joke about penguins").is_none());
    }

    #[test]
    fn keyword_boost_lifts_weak_match() {
        let entries = vec![entry(
            "Do you accept dental insurance plans?",
            "Yes, most major plans.",
            &["insurance", "dental"],
        )];
        // Lexically distant but both keywords hit.
        match match_knowledge_base(&entries, "is dental insurance something you take") {
            Some(_) => {}
            None => panic!("keyword boost should produce at least a suggestion"),
        }
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", "abc"), 0);
    }
}
