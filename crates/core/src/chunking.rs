use crate::extractor::PageText;

pub fn normalize_whitespace(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .replace('\u{3000}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Drops control characters left over by PDF text extraction and collapses whitespace.
pub fn clean_page_text(text: &str) -> String {
    let stripped: String = text
        .chars()
        .map(|c| if c.is_control() && !c.is_whitespace() { ' ' } else { c })
        .collect();
    normalize_whitespace(&stripped)
}

/// Concatenates page texts for the metadata extractor within `max_chars` characters.
///
/// Whole pages are kept in order while they fit; the first page that overflows is cut
/// at a character boundary and nothing after it is included.
pub fn bounded_document_text(pages: &[PageText], max_chars: usize) -> String {
    let mut output = String::new();
    let mut used = 0usize;

    for page in pages {
        let text = page.text.trim();
        if text.is_empty() {
            continue;
        }

        let separator = if output.is_empty() { 0 } else { 1 };
        let length = text.chars().count();

        if used + separator + length <= max_chars {
            if separator == 1 {
                output.push('\n');
            }
            output.push_str(text);
            used += separator + length;
            continue;
        }

        let remaining = max_chars.saturating_sub(used + separator);
        if remaining > 0 {
            if separator == 1 {
                output.push('\n');
            }
            output.extend(text.chars().take(remaining));
        }
        break;
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(number: u32, text: &str) -> PageText {
        PageText {
            number,
            text: text.to_string(),
        }
    }

    #[test]
    fn whitespace_is_normalized() {
        let input = "A  \t  lot\nof\u{3000}spacing";
        assert_eq!(normalize_whitespace(input), "A lot of spacing");
    }

    #[test]
    fn control_characters_are_removed() {
        assert_eq!(clean_page_text("Total\u{0}\u{7}  amount\n"), "Total amount");
    }

    #[test]
    fn whole_pages_are_kept_while_they_fit() {
        let pages = vec![page(1, "abcd"), page(2, "efgh"), page(3, "ijkl")];
        assert_eq!(bounded_document_text(&pages, 9), "abcd\nefgh");
    }

    #[test]
    fn overflowing_page_is_cut_on_char_boundary() {
        let pages = vec![page(1, "甲方乙方"), page(2, "合同金额五十万")];
        let text = bounded_document_text(&pages, 7);
        assert_eq!(text, "甲方乙方\n合同");
        assert_eq!(text.chars().count(), 7);
    }

    #[test]
    fn blank_pages_are_skipped() {
        let pages = vec![page(1, "   "), page(2, "body")];
        assert_eq!(bounded_document_text(&pages, 100), "body");
    }
}
