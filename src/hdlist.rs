use crate::compression;
use crate::errors::*;
use crate::synthesis::PackageRecord;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const RPM_HEADER_MAGIC: [u8; 3] = [0x8e, 0xad, 0xe8];
pub const RPM_LEAD_MAGIC: [u8; 4] = [0xed, 0xab, 0xee, 0xdb];
const RPM_LEAD_SIZE: usize = 96;

pub const RPMTAG_NAME: u32 = 1000;
pub const RPMTAG_VERSION: u32 = 1001;
pub const RPMTAG_RELEASE: u32 = 1002;
pub const RPMTAG_EPOCH: u32 = 1003;
pub const RPMTAG_SUMMARY: u32 = 1004;
pub const RPMTAG_DESCRIPTION: u32 = 1005;
pub const RPMTAG_SIZE: u32 = 1009;
pub const RPMTAG_LICENSE: u32 = 1014;
pub const RPMTAG_GROUP: u32 = 1016;
pub const RPMTAG_URL: u32 = 1020;
pub const RPMTAG_ARCH: u32 = 1022;
pub const RPMTAG_PROVIDENAME: u32 = 1047;
pub const RPMTAG_REQUIRENAME: u32 = 1049;
pub const RPMTAG_CONFLICTNAME: u32 = 1054;
pub const RPMTAG_OBSOLETENAME: u32 = 1090;
pub const RPMTAG_RECOMMENDNAME: u32 = 5046;
pub const RPMTAG_SUGGESTNAME: u32 = 5049;
pub const RPMTAG_SUPPLEMENTNAME: u32 = 5052;
pub const RPMTAG_ENHANCENAME: u32 = 5055;

pub const RPM_INT32: u32 = 4;
pub const RPM_STRING: u32 = 6;
pub const RPM_STRING_ARRAY: u32 = 8;
pub const RPM_I18NSTRING: u32 = 9;

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    tag: u32,
    typ: u32,
    offset: usize,
    count: usize,
}

#[derive(Debug, Clone)]
enum TagValue {
    Str(String),
    Int(u32),
    StrVec(Vec<String>),
}

/// One parsed RPM header. Tag retrieval is on demand and memoized.
pub struct RpmHeader {
    index: Vec<IndexEntry>,
    store: Vec<u8>,
    cache: RefCell<HashMap<u32, TagValue>>,
}

impl RpmHeader {
    fn entry(&self, tag: u32) -> Option<IndexEntry> {
        self.index.iter().find(|e| e.tag == tag).copied()
    }

    fn cstr_at(&self, offset: usize) -> String {
        let slice = &self.store[offset.min(self.store.len())..];
        let end = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
        String::from_utf8_lossy(&slice[..end]).into_owned()
    }

    pub fn get_string(&self, tag: u32) -> Result<Option<String>> {
        if let Some(TagValue::Str(s)) = self.cache.borrow().get(&tag) {
            return Ok(Some(s.clone()));
        }
        let Some(entry) = self.entry(tag) else {
            return Ok(None);
        };
        if entry.typ != RPM_STRING && entry.typ != RPM_I18NSTRING {
            return Err(Error::BadHeaderTag(tag));
        }
        let value = self.cstr_at(entry.offset);
        self.cache
            .borrow_mut()
            .insert(tag, TagValue::Str(value.clone()));
        Ok(Some(value))
    }

    pub fn get_int32(&self, tag: u32) -> Result<Option<u32>> {
        if let Some(TagValue::Int(n)) = self.cache.borrow().get(&tag) {
            return Ok(Some(*n));
        }
        let Some(entry) = self.entry(tag) else {
            return Ok(None);
        };
        if entry.typ != RPM_INT32 {
            return Err(Error::BadHeaderTag(tag));
        }
        let bytes = self
            .store
            .get(entry.offset..entry.offset + 4)
            .ok_or(Error::TruncatedHeader)?;
        let value = u32::from_be_bytes(bytes.try_into().unwrap());
        self.cache.borrow_mut().insert(tag, TagValue::Int(value));
        Ok(Some(value))
    }

    pub fn get_string_array(&self, tag: u32) -> Result<Vec<String>> {
        if let Some(TagValue::StrVec(v)) = self.cache.borrow().get(&tag) {
            return Ok(v.clone());
        }
        let Some(entry) = self.entry(tag) else {
            return Ok(Vec::new());
        };
        if entry.typ != RPM_STRING_ARRAY && entry.typ != RPM_I18NSTRING {
            return Err(Error::BadHeaderTag(tag));
        }
        let mut strings = Vec::with_capacity(entry.count);
        let mut pos = entry.offset;
        for _ in 0..entry.count {
            if pos >= self.store.len() {
                break;
            }
            let value = self.cstr_at(pos);
            pos += value.len() + 1;
            strings.push(value);
        }
        self.cache
            .borrow_mut()
            .insert(tag, TagValue::StrVec(strings.clone()));
        Ok(strings)
    }

    pub fn to_record(&self) -> Result<PackageRecord> {
        let name = self.get_string(RPMTAG_NAME)?.unwrap_or_default();
        let epoch = self.get_int32(RPMTAG_EPOCH)?.unwrap_or(0) as i64;
        let version = self.get_string(RPMTAG_VERSION)?.unwrap_or_default();
        let release = self.get_string(RPMTAG_RELEASE)?.unwrap_or_default();
        let arch = self
            .get_string(RPMTAG_ARCH)?
            .unwrap_or_else(|| "noarch".to_string());

        let evr = if epoch > 0 {
            format!("{epoch}:{version}-{release}")
        } else {
            format!("{version}-{release}")
        };

        Ok(PackageRecord {
            nevra: format!("{name}-{evr}.{arch}"),
            name,
            epoch,
            version,
            release,
            arch,
            summary: self.get_string(RPMTAG_SUMMARY)?.unwrap_or_default(),
            description: self.get_string(RPMTAG_DESCRIPTION)?.unwrap_or_default(),
            size: self.get_int32(RPMTAG_SIZE)?.unwrap_or(0) as i64,
            filesize: 0,
            group: self.get_string(RPMTAG_GROUP)?.unwrap_or_default(),
            url: self.get_string(RPMTAG_URL)?.unwrap_or_default(),
            license: self.get_string(RPMTAG_LICENSE)?.unwrap_or_default(),
            provides: self.get_string_array(RPMTAG_PROVIDENAME)?,
            requires: self.get_string_array(RPMTAG_REQUIRENAME)?,
            conflicts: self.get_string_array(RPMTAG_CONFLICTNAME)?,
            obsoletes: self.get_string_array(RPMTAG_OBSOLETENAME)?,
            recommends: self.get_string_array(RPMTAG_RECOMMENDNAME)?,
            suggests: self.get_string_array(RPMTAG_SUGGESTNAME)?,
            supplements: self.get_string_array(RPMTAG_SUPPLEMENTNAME)?,
            enhances: self.get_string_array(RPMTAG_ENHANCENAME)?,
        })
    }
}

async fn read_exact_or_eof<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Read one header off the stream.
///
/// Returns `None` at clean EOF. Garbage where the next magic should be stops
/// the stream silently unless this is the first header; truncation inside a
/// header body is always a hard error.
pub async fn read_header<R: AsyncRead + Unpin>(
    reader: &mut R,
    first: bool,
) -> Result<Option<RpmHeader>> {
    let mut magic = [0u8; 3];
    let n = read_exact_or_eof(reader, &mut magic).await?;
    if n == 0 {
        return Ok(None);
    }
    if n < 3 || magic != RPM_HEADER_MAGIC {
        if first {
            return Err(Error::BadHeaderMagic);
        }
        return Ok(None);
    }

    // version byte + 4 reserved bytes
    let mut skip = [0u8; 5];
    if read_exact_or_eof(reader, &mut skip).await? < 5 {
        return Err(Error::TruncatedHeader);
    }

    let mut counts = [0u8; 8];
    if read_exact_or_eof(reader, &mut counts).await? < 8 {
        return Err(Error::TruncatedHeader);
    }
    let nindex = u32::from_be_bytes(counts[0..4].try_into().unwrap()) as usize;
    let store_size = u32::from_be_bytes(counts[4..8].try_into().unwrap()) as usize;

    let mut index_bytes = vec![0u8; nindex * 16];
    if read_exact_or_eof(reader, &mut index_bytes).await? < index_bytes.len() {
        return Err(Error::TruncatedHeader);
    }

    let index = index_bytes
        .chunks_exact(16)
        .map(|chunk| IndexEntry {
            tag: u32::from_be_bytes(chunk[0..4].try_into().unwrap()),
            typ: u32::from_be_bytes(chunk[4..8].try_into().unwrap()),
            offset: u32::from_be_bytes(chunk[8..12].try_into().unwrap()) as usize,
            count: u32::from_be_bytes(chunk[12..16].try_into().unwrap()) as usize,
        })
        .collect();

    let mut store = vec![0u8; store_size];
    if read_exact_or_eof(reader, &mut store).await? < store_size {
        return Err(Error::TruncatedHeader);
    }

    Ok(Some(RpmHeader {
        index,
        store,
        cache: RefCell::new(HashMap::new()),
    }))
}

/// Parse a whole hdlist (compressed or raw) into package records.
pub async fn parse_hdlist(path: &Path) -> Result<Vec<PackageRecord>> {
    let mut reader = compression::open_decompressed_stream(path).await?;
    let mut records = Vec::new();
    let mut first = true;
    while let Some(header) = read_header(&mut reader, first).await? {
        first = false;
        records.push(header.to_record()?);
    }
    Ok(records)
}

/// Read the header of a local .rpm file: lead, signature header (padded to
/// 8 bytes), then the main header.
pub async fn read_rpm_package(path: &Path) -> Result<PackageRecord> {
    let mut file = tokio::fs::File::open(path).await?;
    let filesize = file.metadata().await?.len() as i64;

    let mut lead = [0u8; RPM_LEAD_SIZE];
    file.read_exact(&mut lead)
        .await
        .map_err(|_| Error::TruncatedHeader)?;
    if lead[0..4] != RPM_LEAD_MAGIC {
        return Err(Error::BadHeaderMagic);
    }

    let signature = read_header(&mut file, true)
        .await?
        .ok_or(Error::TruncatedHeader)?;
    let sig_store = signature.store.len();
    let pad = (8 - sig_store % 8) % 8;
    if pad > 0 {
        let mut skip = vec![0u8; pad];
        file.read_exact(&mut skip)
            .await
            .map_err(|_| Error::TruncatedHeader)?;
    }

    let header = read_header(&mut file, true)
        .await?
        .ok_or(Error::TruncatedHeader)?;
    let mut record = header.to_record()?;
    record.filesize = filesize;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a header blob with a NAME string, a SIZE int32 and a
    /// PROVIDENAME string array.
    fn fake_header(name: &str, size: u32, provides: &[&str]) -> Vec<u8> {
        let mut store = Vec::new();
        let name_offset = store.len();
        store.extend_from_slice(name.as_bytes());
        store.push(0);
        // int32 values are 4-byte aligned in the store
        while store.len() % 4 != 0 {
            store.push(0);
        }
        let size_offset = store.len();
        store.extend_from_slice(&size.to_be_bytes());
        let provides_offset = store.len();
        for p in provides {
            store.extend_from_slice(p.as_bytes());
            store.push(0);
        }

        let entries: Vec<(u32, u32, usize, usize)> = vec![
            (RPMTAG_NAME, RPM_STRING, name_offset, 1),
            (RPMTAG_SIZE, RPM_INT32, size_offset, 1),
            (
                RPMTAG_PROVIDENAME,
                RPM_STRING_ARRAY,
                provides_offset,
                provides.len(),
            ),
        ];

        let mut blob = Vec::new();
        blob.extend_from_slice(&RPM_HEADER_MAGIC);
        blob.push(1); // version
        blob.extend_from_slice(&[0u8; 4]); // reserved
        blob.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        blob.extend_from_slice(&(store.len() as u32).to_be_bytes());
        for (tag, typ, offset, count) in entries {
            blob.extend_from_slice(&tag.to_be_bytes());
            blob.extend_from_slice(&typ.to_be_bytes());
            blob.extend_from_slice(&(offset as u32).to_be_bytes());
            blob.extend_from_slice(&(count as u32).to_be_bytes());
        }
        blob.extend_from_slice(&store);
        blob
    }

    #[tokio::test]
    async fn test_read_single_header() {
        let blob = fake_header("vim", 9000000, &["vim", "vim-enhanced"]);
        let mut cursor = &blob[..];
        let header = read_header(&mut cursor, true).await.unwrap().unwrap();
        assert_eq!(header.get_string(RPMTAG_NAME).unwrap().unwrap(), "vim");
        assert_eq!(header.get_int32(RPMTAG_SIZE).unwrap().unwrap(), 9000000);
        assert_eq!(
            header.get_string_array(RPMTAG_PROVIDENAME).unwrap(),
            vec!["vim", "vim-enhanced"]
        );
        // memoized second lookup
        assert_eq!(header.get_string(RPMTAG_NAME).unwrap().unwrap(), "vim");
    }

    #[tokio::test]
    async fn test_concatenated_headers() {
        let mut blob = fake_header("vim", 1, &["vim"]);
        blob.extend(fake_header("firefox", 2, &["firefox", "webclient"]));
        let mut cursor = &blob[..];
        let mut names = Vec::new();
        let mut first = true;
        while let Some(header) = read_header(&mut cursor, first).await.unwrap() {
            first = false;
            names.push(header.get_string(RPMTAG_NAME).unwrap().unwrap());
        }
        assert_eq!(names, vec!["vim", "firefox"]);
    }

    #[tokio::test]
    async fn test_bad_magic_at_start() {
        let blob = b"not an rpm header".to_vec();
        let mut cursor = &blob[..];
        assert!(read_header(&mut cursor, true).await.is_err());
    }

    #[tokio::test]
    async fn test_trailing_garbage_is_silent() {
        let mut blob = fake_header("vim", 1, &["vim"]);
        blob.extend_from_slice(b"\x00\x01garbage");
        let mut cursor = &blob[..];
        assert!(read_header(&mut cursor, true).await.unwrap().is_some());
        assert!(read_header(&mut cursor, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_header_is_error() {
        let mut blob = fake_header("vim", 1, &["vim"]);
        blob.extend(fake_header("firefox", 2, &["firefox"]));
        blob.truncate(blob.len() - 4);
        let mut cursor = &blob[..];
        assert!(read_header(&mut cursor, true).await.unwrap().is_some());
        assert!(read_header(&mut cursor, false).await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_tag_type() {
        let blob = fake_header("vim", 1, &["vim"]);
        let mut cursor = &blob[..];
        let header = read_header(&mut cursor, true).await.unwrap().unwrap();
        assert!(header.get_int32(RPMTAG_NAME).is_err());
    }
}
