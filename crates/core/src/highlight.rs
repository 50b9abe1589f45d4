use crate::models::{ContractMetadata, FieldHighlight, HighlightSpan};

/// Case-insensitive, non-overlapping occurrences of each term, as byte spans into `text`.
pub fn find_term_spans(text: &str, terms: &[String]) -> Vec<HighlightSpan> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut spans = Vec::new();

    for term in terms {
        let needle: Vec<char> = term.chars().flat_map(char::to_lowercase).collect();
        if needle.is_empty() {
            continue;
        }

        let mut position = 0;
        while position + needle.len() <= chars.len() {
            let window = &chars[position..position + needle.len()];
            let matched = window
                .iter()
                .zip(&needle)
                .all(|((_, actual), expected)| actual.to_lowercase().eq(std::iter::once(*expected)));

            if matched {
                let start = window[0].0;
                let end = chars
                    .get(position + needle.len())
                    .map(|(offset, _)| *offset)
                    .unwrap_or(text.len());
                spans.push(HighlightSpan {
                    start,
                    end,
                    term: term.clone(),
                });
                position += needle.len();
            } else {
                position += 1;
            }
        }
    }

    spans.sort_by(|left, right| left.start.cmp(&right.start).then(left.end.cmp(&right.end)));
    spans
}

/// Term-frequency score: `sum(1 + ln(tf))` over the terms that occur at least once.
pub fn lexical_score(text: &str, terms: &[String]) -> f64 {
    let spans = find_term_spans(text, terms);
    terms
        .iter()
        .map(|term| spans.iter().filter(|span| &span.term == term).count())
        .filter(|count| *count > 0)
        .map(|count| 1.0 + (count as f64).ln())
        .sum()
}

/// Which query terms matched which metadata field.
pub fn metadata_highlights(metadata: &ContractMetadata, terms: &[String]) -> Vec<FieldHighlight> {
    metadata
        .text_fields()
        .into_iter()
        .flat_map(|(field, value)| {
            find_term_spans(value, terms)
                .into_iter()
                .map(move |span| FieldHighlight {
                    field: field.to_string(),
                    term: span.term,
                    start: span.start,
                    end: span.end,
                })
        })
        .collect()
}

/// Boost-weighted lexical score of the metadata's string fields.
pub fn metadata_score(metadata: &ContractMetadata, terms: &[String]) -> f64 {
    metadata
        .text_fields()
        .into_iter()
        .map(|(field, value)| ContractMetadata::field_boost(field) * lexical_score(value, terms))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn spans_are_case_insensitive_byte_offsets() {
        let text = "Pump and PUMP housing";
        let spans = find_term_spans(text, &terms(&["pump"]));
        assert_eq!(spans.len(), 2);
        assert_eq!(&text[spans[0].start..spans[0].end], "Pump");
        assert_eq!(&text[spans[1].start..spans[1].end], "PUMP");
    }

    #[test]
    fn spans_handle_multibyte_text() {
        let text = "甲方：北京科技有限公司";
        let spans = find_term_spans(text, &terms(&["北京科技"]));
        assert_eq!(spans.len(), 1);
        assert_eq!(&text[spans[0].start..spans[0].end], "北京科技");
    }

    #[test]
    fn lexical_score_rewards_more_distinct_terms() {
        let query = terms(&["pump", "valve"]);
        let one = lexical_score("pump pump pump", &query);
        let both = lexical_score("pump valve", &query);
        assert!(both > one);
        assert_eq!(lexical_score("nothing here", &query), 0.0);
    }

    #[test]
    fn metadata_highlights_name_the_field() {
        let metadata = ContractMetadata {
            customer_name: Some("Acme Bank".to_string()),
            project_description: Some("core banking migration".to_string()),
            ..Default::default()
        };

        let highlights = metadata_highlights(&metadata, &terms(&["bank"]));
        let fields: Vec<&str> = highlights.iter().map(|h| h.field.as_str()).collect();
        assert_eq!(fields, vec!["customer_name", "project_description"]);
        assert!(metadata_score(&metadata, &terms(&["acme"])) > 0.0);
    }
}
