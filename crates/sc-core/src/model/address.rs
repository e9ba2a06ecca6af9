//! Address formatting for sample-changer components.
//!
//! Addresses are plain string keys used for lookup and for naming targets in
//! device commands:
//!
//! | component | format | example |
//! |-----------|--------|---------|
//! | basket    | `<basket>` | `"3"` |
//! | pin       | `<basket>:<sample:02>` | `"3:07"` |
//! | cell      | `<row letter><col>` | `"A1"` |
//! | drop      | `<cell>:<drop>` | `"A1:2"` |
//! | crystal   | `<drop>-<index>` | `"A1:2-1"` |
//!
//! All numbers are 1-based.

/// Address of basket `basket_no`.
pub fn basket_address(basket_no: usize) -> String {
    basket_no.to_string()
}

/// Address of pin `sample_no` in basket `basket_no`.
pub fn pin_address(basket_no: usize, sample_no: usize) -> String {
    format!("{}:{:02}", basket_no, sample_no)
}

/// Row letter for a 1-based row number (`1 -> 'A'`).
pub fn row_letter(row_no: usize) -> char {
    let offset = row_no.saturating_sub(1).min(25) as u8;
    (b'A' + offset) as char
}

/// Address of the plate cell at 1-based `row_no`, `col_no`.
pub fn cell_address(row_no: usize, col_no: usize) -> String {
    format!("{}{}", row_letter(row_no), col_no)
}

/// Address of drop `drop_no` inside `cell`.
pub fn drop_address(cell: &str, drop_no: usize) -> String {
    format!("{}:{}", cell, drop_no)
}

/// Address of crystal `index` inside `drop`.
pub fn xtal_address(drop: &str, index: usize) -> String {
    format!("{}-{}", drop, index)
}

/// Split a pin address into `(basket_no, sample_no)`.
pub fn parse_pin_address(address: &str) -> Option<(usize, usize)> {
    let (basket, sample) = address.split_once(':')?;
    Some((basket.trim().parse().ok()?, sample.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_address_pads_sample() {
        assert_eq!(pin_address(3, 7), "3:07");
        assert_eq!(pin_address(29, 16), "29:16");
        assert_eq!(basket_address(12), "12");
    }

    #[test]
    fn test_plate_addresses() {
        let cell = cell_address(1, 1);
        assert_eq!(cell, "A1");
        let drop = drop_address(&cell, 2);
        assert_eq!(drop, "A1:2");
        assert_eq!(xtal_address(&drop, 1), "A1:2-1");
        assert_eq!(cell_address(8, 12), "H12");
    }

    #[test]
    fn test_parse_pin_address() {
        assert_eq!(parse_pin_address("3:07"), Some((3, 7)));
        assert_eq!(parse_pin_address("3"), None);
        assert_eq!(parse_pin_address("A1:2"), None);
    }
}
