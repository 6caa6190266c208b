// Display-width aware text helpers for table rendering
use unicode_segmentation::UnicodeSegmentation;
use unicode_width::UnicodeWidthStr;

/// Truncates to `max_width` display columns, ending in "..." when cut
pub fn truncate_str(s: &str, max_width: usize) -> String {
    if max_width <= 3 {
        return ".".repeat(max_width);
    }

    if s.width() <= max_width {
        return s.to_string();
    }

    let target_width = max_width - 3;
    let mut accumulated_width = 0;
    let mut result = String::new();

    for grapheme in s.graphemes(true) {
        let grapheme_width = grapheme.width();
        if accumulated_width + grapheme_width > target_width {
            break;
        }
        result.push_str(grapheme);
        accumulated_width += grapheme_width;
    }

    format!("{result}...")
}

/// Truncates, then pads with spaces to exactly `width` columns
pub fn fit_str(s: &str, width: usize) -> String {
    let mut fitted = truncate_str(s, width);
    let used = fitted.width();
    fitted.push_str(&" ".repeat(width.saturating_sub(used)));
    fitted
}
