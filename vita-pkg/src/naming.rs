//! Output naming: region lookup, title sanitizing and the archive/directory name.

use crate::PkgInfo;
use crate::kind::PackageKind;

/// Region codes keyed by the first four characters of a product id.
const REGIONS: &[(&str, &[&str])] = &[
    (
        "EUR",
        &["NPEE", "NPEF", "PCSB", "PCSF", "UCES", "ULES", "NPOA"],
    ),
    (
        "ASA",
        &["NPHI", "NPHJ", "PCSD", "PCSH", "UCAS", "ULAS", "NPQA"],
    ),
    (
        "JPN",
        &[
            "NPJI", "NPJJ", "PCSC", "PCSG", "UCJM", "ULJM", "UCJS", "ULJS", "UCJB", "NPPA",
        ],
    ),
    (
        "USA",
        &[
            "NPUF", "NPUI", "NPUJ", "PCSA", "PCSE", "UCUS", "ULUS", "NPUH", "NPNA",
        ],
    ),
    ("KOR", &["UCKS", "ULKS"]),
    ("INT", &["PCSI", "NPXS"]),
];

/// Returns the region code of a product id, or `UNK`.
#[must_use]
pub fn region(product_id: &str) -> &'static str {
    let Some(prefix) = product_id.get(..4) else {
        return "UNK";
    };

    REGIONS
        .iter()
        .find(|(_, prefixes)| prefixes.contains(&prefix))
        .map_or("UNK", |(region, _)| *region)
}

/// Makes a title usable as a file name.
///
/// Printable ASCII and all non-ASCII characters are kept except `<>"/\|?*`,
/// `:` becomes ` -`, a newline becomes a space and other control characters
/// are dropped.
#[must_use]
pub fn sanitize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());

    for c in title.chars() {
        match c {
            ':' => out.push_str(" -"),
            '\n' => out.push(' '),
            '<' | '>' | '"' | '/' | '\\' | '|' | '?' | '*' => {}
            ' '..='~' => out.push(c),
            c if !c.is_ascii() => out.push(c),
            _ => {}
        }
    }

    out
}

/// Returns the deterministic name of the output archive or directory, without extension.
#[must_use]
pub fn output_name(info: &PkgInfo) -> String {
    let title = info.title();
    let id = info.product_id();

    match info.kind() {
        PackageKind::Psp(variant) => format!("{title} [{id}] [{}]", variant.tag()),
        PackageKind::PspTheme => format!("{title} [{id}] [PSP-Theme]"),
        PackageKind::Psx | PackageKind::Ps3Legacy => {
            format!("{title} [{id}] [{}] [PSX]", region(id))
        }
        PackageKind::VitaDlc => {
            format!("{title} [{id}] [{}] [DLC-{}]", region(id), info.label())
        }
        PackageKind::VitaPatch => format!(
            "{title} [{id}] [{}] [PATCH] [v{}]",
            region(id),
            info.app_version().unwrap_or_default()
        ),
        PackageKind::VitaPsm => format!("{id} [{}] [PSM]", region(id)),
        PackageKind::VitaApp | PackageKind::VitaTheme => {
            format!("{title} [{id}] [{}]", region(id))
        }
    }
}
