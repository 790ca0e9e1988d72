//! CSS aspect-ratio strings from pixel dimensions.

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Reduce `width/height` to lowest terms, formatted for the CSS
/// `aspect-ratio` property. A zero dimension is passed through unreduced.
pub(crate) fn simplify_ratio(width: u32, height: u32) -> String {
    let divisor = gcd(width, height).max(1);
    format!("{}/{}", width / divisor, height / divisor)
}
