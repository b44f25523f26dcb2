//! Category heuristic for layers whose source carries no category field.
//!
//! Both tables are ordered and matching is first-hit-wins, so reordering an
//! entry changes results for identifiers that match more than one group.

use imcache_core::OTHER_CATEGORY;

/// Tier one: known layer identifiers per category, in declaration order.
/// An identifier matches when it equals or contains a listed identifier.
pub const KNOWN_LAYER_GROUPS: &[(&str, &[&str])] = &[
    (
        "Corrected Reflectance",
        &[
            "VIIRS_SNPP_CorrectedReflectance_TrueColor",
            "VIIRS_NOAA20_CorrectedReflectance_TrueColor",
            "MODIS_Terra_CorrectedReflectance_TrueColor",
            "MODIS_Aqua_CorrectedReflectance_TrueColor",
            "MODIS_Terra_CorrectedReflectance_Bands367",
            "MODIS_Terra_CorrectedReflectance_Bands721",
            "MODIS_Aqua_CorrectedReflectance_Bands721",
        ],
    ),
    (
        "Fires",
        &[
            "MODIS_Terra_Thermal_Anomalies_All",
            "MODIS_Aqua_Thermal_Anomalies_All",
            "VIIRS_SNPP_Thermal_Anomalies_375m_Day",
            "VIIRS_SNPP_Thermal_Anomalies_375m_Night",
            "VIIRS_NOAA20_Thermal_Anomalies_375m_Day",
            "VIIRS_NOAA20_Thermal_Anomalies_375m_Night",
        ],
    ),
    (
        "Aerosols",
        &[
            "MODIS_Combined_Value_Added_AOD",
            "MODIS_Terra_Aerosol_Optical_Depth_3km",
            "MODIS_Aqua_Aerosol_Optical_Depth_3km",
            "OMI_Aerosol_Index",
        ],
    ),
    (
        "Sea Ice",
        &["AMSR2_Sea_Ice_Concentration_12km", "MODIS_Terra_Sea_Ice", "MODIS_Aqua_Sea_Ice"],
    ),
    (
        "Snow Cover",
        &["MODIS_Terra_Snow_Cover", "MODIS_Aqua_Snow_Cover", "VIIRS_SNPP_Snow_Cover"],
    ),
    (
        "Land Surface",
        &[
            "MODIS_Terra_Land_Surface_Temp_Day",
            "MODIS_Terra_Land_Surface_Temp_Night",
            "MODIS_Aqua_Land_Surface_Temp_Day",
            "MODIS_Aqua_Land_Surface_Temp_Night",
        ],
    ),
    (
        "Vegetation",
        &[
            "MODIS_Terra_NDVI_8Day",
            "MODIS_Aqua_NDVI_8Day",
            "MODIS_Terra_EVI_8Day",
            "VIIRS_SNPP_NDVI",
        ],
    ),
    (
        "Ocean",
        &[
            "MODIS_Aqua_Chlorophyll_A",
            "MODIS_Terra_Chlorophyll_A",
            "GHRSST_L4_MUR_Sea_Surface_Temperature",
        ],
    ),
    (
        "Water Vapor",
        &["AIRS_L2_Water_Vapor_Volume_Mixing_Ratio", "MODIS_Terra_Water_Vapor_5km"],
    ),
    (
        "Clouds",
        &[
            "MODIS_Terra_Cloud_Fraction_Day",
            "MODIS_Terra_Cloud_Top_Temp_Day",
            "MODIS_Aqua_Cloud_Fraction_Day",
        ],
    ),
    (
        "Reference",
        &[
            "BlueMarble_NextGeneration",
            "BlueMarble_ShadedRelief_Bathymetry",
            "BlueMarble_ShadedRelief",
            "Coastlines",
            "Reference_Features",
            "Reference_Labels",
        ],
    ),
];

/// Tier two: `(keyword, category)` pairs tested against the lowercased
/// identifier.
pub const KEYWORD_CATEGORIES: &[(&str, &str)] = &[
    ("correctedreflectance", "Corrected Reflectance"),
    ("thermal_anomalies", "Fires"),
    ("fires", "Fires"),
    ("_aod", "Aerosols"),
    ("aerosol", "Aerosols"),
    ("sea_ice", "Sea Ice"),
    ("snow", "Snow Cover"),
    ("land_surface_temp", "Land Surface"),
    ("ndvi", "Vegetation"),
    ("_evi", "Vegetation"),
    ("chlorophyll", "Ocean"),
    ("sea_surface_temp", "Ocean"),
    ("water_vapor", "Water Vapor"),
    ("cloud", "Clouds"),
    ("bluemarble", "Reference"),
    ("coastlines", "Reference"),
    ("reference", "Reference"),
];

pub fn categorize(identifier: &str) -> &'static str {
    for &(category, known) in KNOWN_LAYER_GROUPS {
        if known
            .iter()
            .any(|id| identifier == *id || identifier.contains(id))
        {
            return category;
        }
    }

    let lowered = identifier.to_lowercase();
    KEYWORD_CATEGORIES
        .iter()
        .find(|(keyword, _)| lowered.contains(keyword))
        .map(|(_, category)| *category)
        .unwrap_or(OTHER_CATEGORY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_identifiers_resolve_to_their_group() {
        assert_eq!(categorize("MODIS_Terra_Thermal_Anomalies_All"), "Fires");
        assert_eq!(categorize("BlueMarble_NextGeneration"), "Reference");
        assert_eq!(categorize("OMI_Aerosol_Index"), "Aerosols");
    }

    #[test]
    fn unknown_identifiers_fall_to_other() {
        assert_eq!(categorize("XYZ_Unknown_Layer"), "Other");
        assert_eq!(categorize(""), "Other");
    }

    #[test]
    fn known_list_beats_keyword_table() {
        // "cloud" would pick Clouds in tier two, but the identifier contains
        // a known Reference layer.
        assert_eq!(categorize("BlueMarble_NextGeneration_Cloudless"), "Reference");
    }

    #[test]
    fn keyword_tier_is_first_match_in_declaration_order() {
        // matches both "snow" and "cloud"; "snow" is declared first
        assert_eq!(categorize("VIIRS_NOAA20_Snow_Cloud_Mask"), "Snow Cover");
        assert_eq!(categorize("MODIS_Combined_Thermal_Anomalies_Fires"), "Fires");
        assert_eq!(categorize("GOES-East_ABI_Cloud_Top_Height"), "Clouds");
    }

    #[test]
    fn containment_matches_suffixed_variants() {
        assert_eq!(categorize("MODIS_Terra_Snow_Cover_Daily"), "Snow Cover");
        assert_eq!(categorize("Coastlines_15m"), "Reference");
    }
}
