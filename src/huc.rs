//! HUC-8 code helpers: validation, basin prefix, and HUC-2 region names.

/// Returns true for an 8-digit hydrologic unit code.
pub fn is_valid_huc8(code: &str) -> bool {
    code.len() == 8 && code.bytes().all(|b| b.is_ascii_digit())
}

/// HUC-6 basin prefix of a HUC-8 code.
pub fn basin_prefix(huc8: &str) -> Option<&str> {
    if is_valid_huc8(huc8) {
        Some(&huc8[..6])
    } else {
        None
    }
}

/// Human-readable name of the HUC-2 water resource region.
pub fn region_name(huc8: &str) -> &'static str {
    match huc8.get(..2) {
        Some("01") => "New England",
        Some("02") => "Mid-Atlantic",
        Some("03") => "South Atlantic-Gulf",
        Some("04") => "Great Lakes",
        Some("05") => "Ohio",
        Some("06") => "Tennessee",
        Some("07") => "Upper Mississippi",
        Some("08") => "Lower Mississippi",
        Some("09") => "Souris-Red-Rainy",
        Some("10") => "Missouri",
        Some("11") => "Arkansas-White-Red",
        Some("12") => "Texas-Gulf",
        Some("13") => "Rio Grande",
        Some("14") => "Upper Colorado",
        Some("15") => "Lower Colorado",
        Some("16") => "Great Basin",
        Some("17") => "Pacific Northwest",
        Some("18") => "California",
        Some("19") => "Alaska",
        Some("20") => "Hawaii",
        Some("21") => "Caribbean",
        Some("22") => "South Pacific",
        _ => "Unknown",
    }
}
