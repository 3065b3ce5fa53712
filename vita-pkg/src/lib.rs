//! A library for parsing and decrypting PlayStation Vita, PSP and PSX PKG files.
//!
//! # Features
//!
//! - Parse the PKG header, metadata list and encrypted item table
//! - Derive the content keys for every supported key type
//! - Decrypt item names and data on demand at any offset
//! - Resolve the package kind, title and output layout
//!
//! # Example
//!
//! ```no_run
//! use vita_pkg::Pkg;
//! use vita_pkg::source::ItemSource;
//!
//! let bytes = std::fs::read("game.pkg").unwrap();
//! let pkg = Pkg::new(bytes).unwrap();
//!
//! println!("{} ({})", pkg.info().title(), pkg.info().kind().description());
//!
//! for item in pkg.items() {
//!     let item = item.unwrap();
//!     let data = pkg.item_data(&item).unwrap();
//!     println!("{}: {} bytes", item.name(), data.len());
//! }
//! ```
//!
//! # References
//!
//! - [Vita Developer Wiki - Packages](https://wiki.henkaku.xyz/vita/Packages)
//! - [PS3 Developer Wiki - PKG files](https://www.psdevwiki.com/ps3/PKG_files)

use self::crypto::KeySchedule;
use self::header::{ContentId, ITEM_SIZE, PkgHeader};
use self::item::{Item, ItemError};
use self::keys::DerivedKeys;
use self::kind::{ContentType, PackageKind};
use self::meta::Metadata;
use self::sfo::{MAX_SFO_SIZE, ParamSfo, SfoError};
use self::source::ItemReader;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use std::ops::Range;
use tracing::{debug, trace};

use open_error::*;

pub mod crypto;
pub mod header;
pub mod item;
pub mod keys;
pub mod kind;
pub mod meta;
pub mod naming;
pub mod sfo;
pub mod source;

/// Name of the SFO item inside PSP and PSX packages.
const PSP_SFO_NAME: &str = "PARAM.SFO";

/// A parsed PKG file.
///
/// Everything needed to route items is resolved up front; item names and data
/// are decrypted lazily.
#[must_use]
pub struct Pkg<R: AsRef<[u8]>> {
    raw: R,
    header: PkgHeader,
    meta: Metadata,
    keys: DerivedKeys,
    content_type: ContentType,
    info: PkgInfo,
}

impl<R: AsRef<[u8]>> std::fmt::Debug for Pkg<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pkg")
            .field("header", &self.header)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl<R: AsRef<[u8]>> Pkg<R> {
    /// Parses the header, metadata and SFO of a package.
    ///
    /// # Errors
    ///
    /// Fails on a bad magic, any declared range past the end of `raw`, an
    /// unknown content or key type, or a malformed SFO.
    pub fn new(raw: R) -> Result<Self, OpenError> {
        let data = raw.as_ref();
        let len = data.len() as u64;

        let header = PkgHeader::read(data).context(ReadHeaderFailedSnafu)?;
        let meta = Metadata::read(data, header.meta_offset(), header.meta_count())
            .context(ReadMetadataFailedSnafu)?;
        let content_type =
            ContentType::from_code(meta.content_type()).context(UnsupportedContentSnafu)?;
        let keys = DerivedKeys::derive(&header).context(DeriveKeysFailedSnafu)?;

        let table_end = header
            .enc_offset()
            .checked_add(meta.items_offset())
            .and_then(|v| v.checked_add(u64::from(header.item_count()) * ITEM_SIZE));
        ensure!(
            table_end.is_some_and(|end| end <= len),
            ItemTableOutOfRangeSnafu {
                offset: meta.items_offset(),
                count: header.item_count()
            }
        );

        let table = ItemTable::new(data, &header, &meta, &keys, content_type);
        let info = PkgInfo::load(data, &header, &meta, content_type, &table)?;

        debug!(
            kind = info.kind.description(),
            content_id = %info.content_id,
            items = header.item_count(),
            key_type = header.key_type(),
            "opened package"
        );

        let pkg = Self {
            raw,
            header,
            meta,
            keys,
            content_type,
            info,
        };

        if pkg.info.kind.has_package_files() {
            for (what, range) in [("head", pkg.head_range()), ("tail", pkg.tail_range())] {
                ensure!(
                    range.start <= range.end && range.end <= len,
                    PackageRangeOutOfBoundsSnafu {
                        what,
                        end: range.end.max(range.start),
                        len
                    }
                );
            }
        }

        Ok(pkg)
    }

    /// Returns the PKG header.
    pub fn header(&self) -> &PkgHeader {
        &self.header
    }

    /// Returns the values from the metadata list.
    pub fn metadata(&self) -> &Metadata {
        &self.meta
    }

    pub fn keys(&self) -> &DerivedKeys {
        &self.keys
    }

    /// Returns the content type from the metadata list.
    #[must_use]
    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    /// Returns the resolved kind, title and content id.
    pub fn info(&self) -> &PkgInfo {
        &self.info
    }

    /// Returns the whole package.
    #[must_use]
    pub fn raw(&self) -> &[u8] {
        self.raw.as_ref()
    }

    /// Returns the package size in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.raw().len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw().is_empty()
    }

    /// Returns the number of item records.
    #[must_use]
    pub fn item_count(&self) -> u32 {
        self.header.item_count()
    }

    /// Returns an iterator over all items in table order.
    pub fn items(&self) -> PkgItems<'_> {
        PkgItems {
            table: self.table(),
            current: 0,
        }
    }

    /// Reads every item record, failing on the first invalid one.
    ///
    /// Returns the number of items.
    pub fn validate(&self) -> Result<u32, ItemError> {
        self.items().try_for_each(|item| item.map(drop))?;
        Ok(self.item_count())
    }

    /// Returns the key that decrypts `item`.
    pub fn item_key(&self, item: &Item) -> &KeySchedule {
        self.table().key_for(item)
    }

    /// Returns a reader over the decrypted data of `item`.
    pub fn item_data(&self, item: &Item) -> Result<ItemReader<'_>, ItemError> {
        self.table().reader(item, true)
    }

    /// Returns a reader over the stored (encrypted) data of `item`.
    pub fn item_ciphertext(&self, item: &Item) -> Result<ItemReader<'_>, ItemError> {
        self.table().reader(item, false)
    }

    /// Returns the byte range stored as `sce_sys/package/head.bin`.
    #[must_use]
    pub fn head_range(&self) -> Range<u64> {
        0..self.header.enc_offset().saturating_add(self.meta.items_size())
    }

    /// Returns the byte range stored as `sce_sys/package/tail.bin`.
    #[must_use]
    pub fn tail_range(&self) -> Range<u64> {
        let start = self.header.enc_offset().saturating_add(self.header.enc_size());
        start..self.len()
    }

    fn table(&self) -> ItemTable<'_> {
        ItemTable::new(
            self.raw(),
            &self.header,
            &self.meta,
            &self.keys,
            self.content_type,
        )
    }
}

/// Kind, title and identifiers of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct PkgInfo {
    kind: PackageKind,
    title: String,
    content_id: String,
    category: String,
    min_version: Option<String>,
    app_version: Option<String>,
}

impl PkgInfo {
    fn load(
        data: &[u8],
        header: &PkgHeader,
        meta: &Metadata,
        content_type: ContentType,
        table: &ItemTable<'_>,
    ) -> Result<Self, OpenError> {
        let header_id = header.content_id();

        let sfo = match content_type {
            ContentType::Psp(_) | ContentType::Psx => table.find_sfo()?,
            ContentType::VitaApp | ContentType::VitaDlc | ContentType::VitaTheme => {
                match meta.sfo() {
                    Some((offset, size)) => Some(read_plain_sfo(data, offset, size)?),
                    None => None,
                }
            }
            ContentType::Ps3 | ContentType::PspTheme | ContentType::VitaPsm => None,
        };

        let title = match (&sfo, content_type) {
            (Some(sfo), _) => sfo.title.clone(),
            // Everything after the service prefix, e.g. `NPUJ00001_00-0000000000000001`.
            (None, ContentType::Ps3) => header_id.as_str().get(7..).unwrap_or("").to_owned(),
            (None, ContentType::PspTheme) => header.display_title().replace(':', " "),
            (None, _) => header_id.product_id().to_owned(),
        };

        let content_id = sfo
            .as_ref()
            .and_then(|sfo| sfo.content_id.clone())
            .filter(|_| !content_type.uses_legacy_keys())
            .unwrap_or_else(|| header_id.as_str().to_owned());

        let category = sfo.as_ref().map(|s| s.category.clone()).unwrap_or_default();
        let kind = content_type.resolve(&category, meta.install_directory().is_some());

        Ok(Self {
            kind,
            title: naming::sanitize_title(&title),
            content_id,
            category,
            min_version: sfo.as_ref().and_then(|s| s.min_version.clone()),
            app_version: sfo.and_then(|s| s.app_version),
        })
    }

    #[must_use]
    pub fn kind(&self) -> PackageKind {
        self.kind
    }

    /// Returns the sanitized title.
    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Returns the content id (from the SFO for Vita packages, the header otherwise).
    #[must_use]
    pub fn content_id(&self) -> ContentId<'_> {
        ContentId::new(self.content_id.as_bytes())
    }

    /// Returns the 9-character product id.
    #[must_use]
    pub fn product_id(&self) -> &str {
        self.content_id().product_id()
    }

    /// Returns the content id label, used as the DLC directory name.
    #[must_use]
    pub fn label(&self) -> &str {
        self.content_id().label()
    }

    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Returns the minimum firmware version, e.g. `3.60`.
    #[must_use]
    pub fn min_version(&self) -> Option<&str> {
        self.min_version.as_deref()
    }

    /// Returns the application version, e.g. `1.05`.
    #[must_use]
    pub fn app_version(&self) -> Option<&str> {
        self.app_version.as_deref()
    }
}

fn read_plain_sfo(data: &[u8], offset: u64, size: u32) -> Result<ParamSfo, OpenError> {
    let raw = usize::try_from(offset)
        .ok()
        .and_then(|start| data.get(start..start.checked_add(size as usize)?))
        .context(SfoOutOfRangeSnafu { offset, size })?;

    ParamSfo::parse(raw).context(ParseSfoFailedSnafu)
}

/// Borrowed view over the item table with the keys needed to read it.
#[derive(Clone, Copy)]
struct ItemTable<'a> {
    raw: &'a [u8],
    iv: &'a [u8; 16],
    keys: &'a DerivedKeys,
    enc_offset: u64,
    items_offset: u64,
    count: u32,
    legacy: bool,
}

impl<'a> ItemTable<'a> {
    fn new(
        raw: &'a [u8],
        header: &'a PkgHeader,
        meta: &Metadata,
        keys: &'a DerivedKeys,
        content_type: ContentType,
    ) -> Self {
        Self {
            raw,
            iv: header.iv(),
            keys,
            enc_offset: header.enc_offset(),
            items_offset: meta.items_offset(),
            count: header.item_count(),
            legacy: content_type.uses_legacy_keys(),
        }
    }

    fn key_for(&self, item: &Item) -> &'a KeySchedule {
        if self.legacy {
            self.keys.legacy_item_key(item.payload_type())
        } else {
            self.keys.main()
        }
    }

    fn slice(&self, offset: u64, len: u64) -> Option<&'a [u8]> {
        let start = usize::try_from(self.enc_offset.checked_add(offset)?).ok()?;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        self.raw.get(start..end)
    }

    fn read(&self, index: u32) -> Result<Item, ItemError> {
        let rel = self.items_offset + u64::from(index) * ITEM_SIZE;

        let mut record = [0u8; Item::RAW_SIZE];
        record.copy_from_slice(self.slice(rel, ITEM_SIZE).context(
            item::RecordOutOfRangeSnafu {
                index,
                offset: self.enc_offset + rel,
            },
        )?);

        // Records are always encrypted with the main key.
        self.keys.main().ctr_xor(self.iv, rel / 16, &mut record);

        let mut item = Item::parse(index, &record);
        item.validate(self.enc_offset, self.raw.len() as u64)?;

        let mut name = self
            .slice(item.name_offset(), u64::from(item.name_size()))
            .context(item::OutOfRangeSnafu {
                index,
                field: "name",
                end: item.name_offset() + u64::from(item.name_size()),
                pkg_size: self.raw.len() as u64,
            })?
            .to_vec();
        self.key_for(&item)
            .ctr_xor(self.iv, item.name_offset() / 16, &mut name);

        let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        item.set_name(String::from_utf8_lossy(&name[..len]).into_owned());

        trace!(
            index,
            name = item.name(),
            flags = item.flags(),
            size = item.data_size(),
            "item"
        );

        Ok(item)
    }

    fn reader(&self, item: &Item, decrypt: bool) -> Result<ItemReader<'a>, ItemError> {
        let data = self
            .slice(item.data_offset(), item.data_size())
            .context(item::OutOfRangeSnafu {
                index: item.index(),
                field: "data",
                end: item.data_offset().saturating_add(item.data_size()),
                pkg_size: self.raw.len() as u64,
            })?;

        let key = decrypt.then(|| self.key_for(item));
        Ok(ItemReader::new(data, key, self.iv, item.data_offset()))
    }

    /// Finds and parses the encrypted `PARAM.SFO` item of PSP and PSX packages.
    fn find_sfo(&self) -> Result<Option<ParamSfo>, OpenError> {
        for index in 0..self.count {
            let item = self.read(index).context(ReadItemFailedSnafu)?;
            if item.name() != PSP_SFO_NAME {
                continue;
            }

            let size = item.data_size();
            if size > MAX_SFO_SIZE {
                return Err(SfoError::TooBig { size }).context(ParseSfoFailedSnafu);
            }

            let data = self.reader(&item, true).context(ReadItemFailedSnafu)?;
            return ParamSfo::parse(&data.read_all())
                .map(Some)
                .context(ParseSfoFailedSnafu);
        }

        debug!("no {PSP_SFO_NAME} item, using the header for the title");
        Ok(None)
    }
}

/// Iterator over package items.
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct PkgItems<'a> {
    table: ItemTable<'a>,
    current: u32,
}

impl std::fmt::Debug for PkgItems<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkgItems")
            .field("current", &self.current)
            .field("total", &self.table.count)
            .finish_non_exhaustive()
    }
}

impl Iterator for PkgItems<'_> {
    type Item = Result<Item, ItemError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.table.count {
            return None;
        }

        let index = self.current;
        self.current += 1;

        Some(self.table.read(index))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.table.count - self.current) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for PkgItems<'_> {}

#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum OpenError {
    #[snafu(display("invalid PKG header"))]
    ReadHeaderFailed { source: header::ReadError },

    #[snafu(display("invalid PKG metadata"))]
    ReadMetadataFailed { source: meta::MetaError },

    #[snafu(display("unsupported package"))]
    UnsupportedContent { source: kind::KindError },

    #[snafu(display("cannot derive package keys"))]
    DeriveKeysFailed { source: keys::KeyError },

    #[snafu(display("item table at 0x{offset:X} with {count} items runs past the end of the PKG"))]
    ItemTableOutOfRange { offset: u64, count: u32 },

    #[snafu(display("failed to read item"))]
    ReadItemFailed { source: ItemError },

    #[snafu(display("SFO at 0x{offset:X} ({size} bytes) runs past the end of the PKG"))]
    SfoOutOfRange { offset: u64, size: u32 },

    #[snafu(display("invalid SFO"))]
    ParseSfoFailed { source: SfoError },

    #[snafu(display("{what} range ends at 0x{end:X}, past the PKG size 0x{len:X}"))]
    PackageRangeOutOfBounds {
        what: &'static str,
        end: u64,
        len: u64,
    },
}
