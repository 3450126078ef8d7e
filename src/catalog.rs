//! Static defect code catalog and the default placeholder lists.

/// Defect code reported when two wires are swapped in a connector cavity.
pub const INVERTED_WIRES_CODE: &str = "210";

pub const UNKNOWN_OPERATOR: &str = "Opérateur inconnu";

pub struct DefectCategory {
    pub name: &'static str,
    pub codes: &'static [(&'static str, &'static str)],
}

pub const CATEGORIES: &[DefectCategory] = &[
    DefectCategory {
        name: "Sertissage",
        codes: &[
            ("101", "Sertissage hors tolérance"),
            ("102", "Isolant serti"),
            ("103", "Brins coupés"),
            ("104", "Terminal déformé"),
            ("105", "Hauteur de sertissage incorrecte"),
        ],
    },
    DefectCategory {
        name: "Câblage",
        codes: &[
            ("201", "Fil manquant"),
            ("202", "Fil mal positionné"),
            ("203", "Longueur de fil incorrecte"),
            ("204", "Fil endommagé"),
            ("210", "Fils inversés"),
        ],
    },
    DefectCategory {
        name: "Assemblage",
        codes: &[
            ("301", "Connecteur manquant"),
            ("302", "Verrou secondaire non engagé"),
            ("303", "Clip manquant"),
            ("304", "Ruban mal enroulé"),
        ],
    },
    DefectCategory {
        name: "Contrôle",
        codes: &[
            ("401", "Étiquette manquante"),
            ("402", "Test électrique non conforme"),
            ("403", "Documentation incomplète"),
        ],
    },
];

pub fn defect_name(code: &str) -> Option<&'static str> {
    let code = code.trim();
    CATEGORIES
        .iter()
        .flat_map(|category| category.codes.iter())
        .find(|(candidate, _)| *candidate == code)
        .map(|(_, name)| *name)
}

pub fn category_of(code: &str) -> Option<&'static str> {
    let code = code.trim();
    CATEGORIES
        .iter()
        .find(|category| category.codes.iter().any(|(candidate, _)| *candidate == code))
        .map(|category| category.name)
}

pub fn default_virtual_operators() -> Vec<String> {
    [
        "Test Operator",
        "Opérateur Test",
        "Opérateur test",
        "Opérateur virtuel",
        "Virtual Operator",
        "Demo Operator",
        "John Doe",
        "Jane Doe",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

pub fn default_virtual_references() -> Vec<String> {
    ["REF-TEST", "REF-DEMO", "TEST-001", "DEMO-001", "VIRTUAL"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_codes() {
        assert_eq!(defect_name("210"), Some("Fils inversés"));
        assert_eq!(defect_name(" 101 "), Some("Sertissage hors tolérance"));
        assert_eq!(category_of("302"), Some("Assemblage"));
    }

    #[test]
    fn unknown_codes_resolve_to_none() {
        assert_eq!(defect_name("999"), None);
        assert_eq!(category_of(""), None);
    }

    #[test]
    fn codes_are_unique_across_categories() {
        let mut codes: Vec<&str> = CATEGORIES
            .iter()
            .flat_map(|category| category.codes.iter().map(|(code, _)| *code))
            .collect();
        let total = codes.len();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), total);
    }
}
