//! Package kinds and the per-kind table of well known item names.
//!
//! Each kind owns a short list of known names that decide where an item
//! lands and how its bytes are produced. Items that match no entry use the
//! kind's fallback action.

use snafu::Snafu;

use NamePattern::{Contains, Exact, Prefix};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum KindError {
    #[snafu(display("unsupported content type 0x{code:X}"))]
    UnsupportedContentType { code: u32 },
}

/// Content type code from the metadata list.
///
/// Reference: <https://www.psdevwiki.com/ps3/PKG_files#ContentType>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Ps3,
    Psx,
    Psp(u32),
    PspTheme,
    VitaApp,
    VitaDlc,
    VitaPsm,
    VitaTheme,
}

impl ContentType {
    pub fn from_code(code: u32) -> Result<Self, KindError> {
        Ok(match code {
            0x01 => Self::Ps3,
            0x06 => Self::Psx,
            0x07 | 0x0E | 0x0F | 0x10 => Self::Psp(code),
            0x09 => Self::PspTheme,
            0x15 => Self::VitaApp,
            0x16 => Self::VitaDlc,
            0x18 | 0x1D => Self::VitaPsm,
            0x1F => Self::VitaTheme,
            _ => return UnsupportedContentTypeSnafu { code }.fail(),
        })
    }

    /// Returns `true` when items pick their key by payload type.
    #[must_use]
    pub const fn uses_legacy_keys(self) -> bool {
        matches!(self, Self::Psp(_) | Self::Psx | Self::PspTheme)
    }

    /// Returns `true` when the SFO must be looked up in the item table.
    #[must_use]
    pub const fn has_item_sfo(self) -> bool {
        matches!(self, Self::Psp(_) | Self::Psx)
    }

    /// Resolves the final kind once the SFO category and install directory are known.
    pub fn resolve(self, category: &str, install_directory: bool) -> PackageKind {
        match self {
            Self::Ps3 => PackageKind::Ps3Legacy,
            Self::Psx => PackageKind::Psx,
            Self::Psp(code) => PackageKind::Psp(match code {
                0x0E => PspVariant::Go,
                0x0F => PspVariant::Mini,
                0x10 => PspVariant::NeoGeo,
                _ if category == "HG" => PspVariant::PcEngine,
                _ if install_directory => PspVariant::Dlc,
                _ => PspVariant::Standard,
            }),
            Self::PspTheme => PackageKind::PspTheme,
            Self::VitaApp if category == "gp" => PackageKind::VitaPatch,
            Self::VitaApp => PackageKind::VitaApp,
            Self::VitaDlc => PackageKind::VitaDlc,
            Self::VitaPsm => PackageKind::VitaPsm,
            Self::VitaTheme => PackageKind::VitaTheme,
        }
    }
}

/// Flavor of a PSP package, used only in the output name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PspVariant {
    Standard,
    PcEngine,
    Dlc,
    Go,
    Mini,
    NeoGeo,
}

impl PspVariant {
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Standard => "PSP",
            Self::PcEngine => "PSP-PCEngine",
            Self::Dlc => "PSP-DLC",
            Self::Go => "PSP-Go",
            Self::Mini => "PSP-Mini",
            Self::NeoGeo => "PSP-NeoGeo",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageKind {
    VitaApp,
    VitaPatch,
    VitaDlc,
    VitaPsm,
    VitaTheme,
    Psp(PspVariant),
    PspTheme,
    Psx,
    /// PSX content wrapped in a PS3 package.
    Ps3Legacy,
}

impl PackageKind {
    /// Returns a short human readable description.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::VitaApp => "Vita APP",
            Self::VitaPatch => "Vita PATCH",
            Self::VitaDlc => "Vita DLC",
            Self::VitaPsm => "Vita PSM",
            Self::VitaTheme => "Vita theme",
            Self::Psp(variant) => variant.tag(),
            Self::PspTheme => "PSP Theme",
            Self::Psx => "PSX",
            Self::Ps3Legacy => "PS3 PSX",
        }
    }

    /// Returns `true` for the kinds carrying `sce_sys/package` files.
    #[must_use]
    pub const fn has_package_files(self) -> bool {
        matches!(
            self,
            Self::VitaApp | Self::VitaPatch | Self::VitaDlc | Self::VitaTheme
        )
    }

    /// Returns `true` for the kinds decoded by the legacy image pipeline.
    #[must_use]
    pub const fn is_legacy(self) -> bool {
        matches!(self, Self::Psp(_) | Self::Psx | Self::PspTheme)
    }

    /// Returns where a license blob goes for this kind, if it takes one.
    #[must_use]
    pub const fn license_layout(self) -> Option<LicenseLayout> {
        match self {
            Self::VitaApp | Self::VitaDlc | Self::VitaTheme => Some(LicenseLayout {
                size: 512,
                content_id_offset: 0x10,
                target: LicenseTarget::WorkBin,
            }),
            Self::VitaPsm => Some(LicenseLayout {
                size: 1024,
                content_id_offset: 0x50,
                target: LicenseTarget::FakeRif,
            }),
            Self::Psx => Some(LicenseLayout {
                size: 512,
                content_id_offset: 0x10,
                target: LicenseTarget::PspLicense,
            }),
            _ => None,
        }
    }

    /// Returns the internal root and the folders emitted before any item.
    pub fn root(self, product_id: &str, label: &str) -> RootLayout {
        let nested = |parts: &[&str]| {
            let folders: Vec<String> = (1..=parts.len()).map(|n| parts[..n].join("/")).collect();
            RootLayout {
                path: folders.last().cloned().unwrap_or_default(),
                folders,
            }
        };
        let flat = |path: String| RootLayout {
            path,
            folders: Vec::new(),
        };

        match self {
            Self::VitaApp | Self::VitaTheme => nested(&["app", product_id]),
            Self::VitaPatch => nested(&["patch", product_id]),
            Self::VitaDlc => nested(&["addcont", product_id, label]),
            Self::VitaPsm => nested(&["psm", product_id]),
            Self::Psp(_) | Self::Psx => flat(format!("pspemu/PSP/GAME/{product_id}")),
            Self::PspTheme => flat("pspemu/PSP/THEME".to_owned()),
            Self::Ps3Legacy => flat("pspemu/PSP/GAME".to_owned()),
        }
    }

    /// Maps a directory item to an output folder. Legacy kinds emit none.
    #[must_use]
    pub fn directory_path(self, name: &str, root: &str) -> Option<String> {
        match self {
            Self::VitaApp | Self::VitaPatch | Self::VitaDlc | Self::VitaTheme => {
                Some(format!("{root}/{name}"))
            }
            Self::VitaPsm if name.contains('/') => Some(psm_path(name, root)),
            _ => None,
        }
    }

    /// Picks the route for a file item.
    ///
    /// Returns `None` when the item is not part of the output.
    #[must_use]
    pub fn route(self, name: &str, options: RouteOptions, ctx: &PathContext<'_>) -> Option<Route> {
        let table = self.table();
        let entry = table.names.iter().find(|known| known.pattern.matches(name));

        let action = match entry {
            Some(known) => known.action(options),
            None => table.fallback,
        };

        let path = action.rule.resolve(name, ctx)?;
        Some(Route {
            path,
            transform: action.transform?,
        })
    }

    fn table(self) -> &'static KindTable {
        match self {
            Self::VitaApp | Self::VitaPatch | Self::VitaDlc | Self::VitaTheme => &VITA_TABLE,
            Self::VitaPsm => &PSM_TABLE,
            Self::Psp(_) => &PSP_TABLE,
            Self::PspTheme => &PSP_THEME_TABLE,
            Self::Psx => &PSX_TABLE,
            Self::Ps3Legacy => &PS3_TABLE,
        }
    }
}

/// Where a decoded license blob is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseTarget {
    /// `{root}/sce_sys/package/work.bin`
    WorkBin,
    /// `{root}/RO/License/FAKE.rif`
    FakeRif,
    /// `pspemu/PSP/LICENSE/{content id}.rif`
    PspLicense,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LicenseLayout {
    /// Exact size of the blob.
    pub size: usize,
    /// Offset of the NUL padded content id inside the blob.
    pub content_id_offset: usize,
    pub target: LicenseTarget,
}

/// Internal output root of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootLayout {
    pub path: String,
    /// Each prefix of `path` that gets an explicit folder entry.
    pub folders: Vec<String>,
}

/// User options that change item routing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteOptions {
    /// Keep `EBOOT.PBP` instead of decoding the disc image.
    pub keep_pbp: bool,
    /// Unwrap `PSP-KEY.EDAT` even when `keep_pbp` is set.
    pub decrypt_always: bool,
}

/// Values substituted into output paths.
#[derive(Debug, Clone, Copy)]
pub struct PathContext<'a> {
    pub root: &'a str,
    pub product_id: &'a str,
    pub title: &'a str,
    /// `iso` or `cso`.
    pub image_extension: &'a str,
}

/// How the bytes of a routed item are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Decrypt and copy.
    Copy,
    /// Copy the ciphertext untouched.
    Passthrough,
    /// Rebuild the disc image from the nested EBOOT container.
    Image,
    /// Recover the 16-byte key from `PSP-KEY.EDAT`.
    UnwrapKey,
}

/// Output path and transform for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub path: String,
    pub transform: Transform,
}

#[derive(Debug, Clone, Copy)]
enum NamePattern {
    Exact(&'static str),
    Contains(&'static str),
    Prefix(&'static str),
}

impl NamePattern {
    fn matches(self, name: &str) -> bool {
        match self {
            Self::Exact(v) => name == v,
            Self::Contains(v) => name.contains(v),
            Self::Prefix(v) => name.starts_with(v),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PathRule {
    /// `{root}/{name}`
    Mirror,
    /// `{root}/{path}`
    Renamed(&'static str),
    /// `content/` dropped, then `{root}/{rest}` for runtime files or `{root}/RO/{rest}`.
    PsmContent,
    /// `pspemu/PSP/GAME/{id}/{file}`
    Game(&'static str),
    /// `USRDIR/CONTENT/{rest}` to `pspemu/PSP/GAME/{id}/{rest}`
    GameSubpath,
    /// `ps1emu/{id}/{file}`
    Ps1Emu(&'static str),
    /// `pspemu/PSP/GAME/{first 9 chars of name}/{file}`
    Ps3Game(&'static str),
    /// `pspemu/PSP/THEME/{name}`
    Theme,
    /// `pspemu/ISO/{title} [{id}].{ext}`
    Image,
}

impl PathRule {
    fn resolve(self, name: &str, ctx: &PathContext<'_>) -> Option<String> {
        let PathContext {
            root,
            product_id: id,
            title,
            image_extension: ext,
        } = *ctx;

        Some(match self {
            Self::Mirror => format!("{root}/{name}"),
            Self::Renamed(path) => format!("{root}/{path}"),
            Self::PsmContent => psm_path(name, root),
            Self::Game(file) => format!("pspemu/PSP/GAME/{id}/{file}"),
            Self::GameSubpath => {
                let rest = name.strip_prefix("USRDIR/CONTENT/")?;
                if rest.is_empty() {
                    return None;
                }
                format!("pspemu/PSP/GAME/{id}/{rest}")
            }
            Self::Ps1Emu(file) => format!("ps1emu/{id}/{file}"),
            Self::Ps3Game(file) => format!("pspemu/PSP/GAME/{}/{file}", name.get(..9)?),
            Self::Theme => format!("pspemu/PSP/THEME/{name}"),
            Self::Image => format!("pspemu/ISO/{title} [{id}].{ext}"),
        })
    }
}

fn psm_path(name: &str, root: &str) -> String {
    let rest = name.split_once('/').map_or(name, |(_, rest)| rest);
    if name.contains("runtime") {
        format!("{root}/{rest}")
    } else {
        format!("{root}/RO/{rest}")
    }
}

/// A path rule plus transform; no transform means the item is skipped.
#[derive(Debug, Clone, Copy)]
struct Action {
    rule: PathRule,
    transform: Option<Transform>,
}

const fn act(rule: PathRule, transform: Transform) -> Action {
    Action {
        rule,
        transform: Some(transform),
    }
}

const SKIP: Action = Action {
    rule: PathRule::Mirror,
    transform: None,
};

#[derive(Debug)]
struct KnownName {
    pattern: NamePattern,
    action: Action,
    /// Replaces `action` when `keep_pbp` is set.
    keep_pbp: Option<Action>,
    /// `decrypt_always` restores `action` even with `keep_pbp`.
    decrypt_override: bool,
}

impl KnownName {
    const fn new(pattern: NamePattern, action: Action) -> Self {
        Self {
            pattern,
            action,
            keep_pbp: None,
            decrypt_override: false,
        }
    }

    const fn with_pbp(pattern: NamePattern, action: Action, keep_pbp: Action) -> Self {
        Self {
            pattern,
            action,
            keep_pbp: Some(keep_pbp),
            decrypt_override: false,
        }
    }

    fn action(&self, options: RouteOptions) -> Action {
        match self.keep_pbp {
            Some(pbp) if options.keep_pbp && !(self.decrypt_override && options.decrypt_always) => {
                pbp
            }
            _ => self.action,
        }
    }
}

#[derive(Debug)]
struct KindTable {
    names: &'static [KnownName],
    fallback: Action,
}

static VITA_TABLE: KindTable = KindTable {
    names: &[
        KnownName::new(
            Exact("sce_sys/package/digs.bin"),
            act(PathRule::Renamed("sce_sys/package/body.bin"), Transform::Passthrough),
        ),
        KnownName::new(
            Exact("sce_sys/package/cert.bin"),
            act(PathRule::Renamed("sce_sys/package/body.bin"), Transform::Passthrough),
        ),
    ],
    fallback: act(PathRule::Mirror, Transform::Copy),
};

static PSM_TABLE: KindTable = KindTable {
    names: &[],
    fallback: act(PathRule::PsmContent, Transform::Copy),
};

static PSX_TABLE: KindTable = KindTable {
    names: &[
        KnownName::new(
            Exact("USRDIR/CONTENT/DOCUMENT.DAT"),
            act(PathRule::Game("DOCUMENT.DAT"), Transform::Copy),
        ),
        KnownName::new(
            Exact("USRDIR/CONTENT/EBOOT.PBP"),
            act(PathRule::Game("EBOOT.PBP"), Transform::Copy),
        ),
        KnownName::new(
            Exact("USRDIR/CONTENT/texture.enc"),
            act(PathRule::Ps1Emu("texture.enc"), Transform::Copy),
        ),
    ],
    fallback: SKIP,
};

static PSP_TABLE: KindTable = KindTable {
    names: &[
        KnownName::with_pbp(
            Exact("USRDIR/CONTENT/EBOOT.PBP"),
            act(PathRule::Image, Transform::Image),
            act(PathRule::Game("EBOOT.PBP"), Transform::Copy),
        ),
        KnownName::with_pbp(
            Exact("USRDIR/CONTENT/DOCUMENT.DAT"),
            SKIP,
            act(PathRule::Game("DOCUMENT.DAT"), Transform::Copy),
        ),
        KnownName::with_pbp(
            Exact("USRDIR/CONTENT/DOCINFO.EDAT"),
            SKIP,
            act(PathRule::Game("DOCINFO.EDAT"), Transform::Copy),
        ),
        KnownName {
            pattern: Exact("USRDIR/CONTENT/PSP-KEY.EDAT"),
            action: act(PathRule::Game("PSP-KEY.EDAT"), Transform::UnwrapKey),
            keep_pbp: Some(act(PathRule::Game("PSP-KEY.EDAT"), Transform::Copy)),
            decrypt_override: true,
        },
        KnownName::new(Prefix("USRDIR/CONTENT/"), act(PathRule::GameSubpath, Transform::Copy)),
    ],
    fallback: SKIP,
};

static PSP_THEME_TABLE: KindTable = KindTable {
    names: &[],
    fallback: act(PathRule::Theme, Transform::Copy),
};

static PS3_TABLE: KindTable = KindTable {
    names: &[
        KnownName::new(
            Contains("DOCUMENT.DAT"),
            act(PathRule::Ps3Game("DOCUMENT.DAT"), Transform::Copy),
        ),
        KnownName::new(Contains("EBOOT.PBP"), act(PathRule::Ps3Game("EBOOT.PBP"), Transform::Copy)),
    ],
    fallback: SKIP,
};
