//! Document Assembler (EPUB 3 writer) and the EPUB reader used as input to
//! the cleanup phase.
//!
//! ## Package layout
//!
//! ```text
//! mimetype                  stored, first entry
//! META-INF/container.xml
//! OEBPS/content.opf
//! OEBPS/nav.xhtml           EPUB 3 navigation
//! OEBPS/toc.ncx             EPUB 2 reader compatibility
//! OEBPS/<chapter files>
//! ```
//!
//! Writing goes to a temporary file in the destination directory and is
//! renamed into place, so a failed run never leaves a truncated EPUB behind.
//! Both directions are synchronous; async callers use `spawn_blocking`.

use super::reconstruct::{escape_xml, xhtml_document};
use crate::error::ScanError;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MIMETYPE: &str = "application/epub+zip";
const OPF_PATH: &str = "OEBPS/content.opf";

/// Dublin Core metadata carried by the package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpubMetadata {
    pub title: String,
    pub author: String,
    pub language: String,
    /// `dc:identifier`, e.g. `urn:uuid:…`.
    pub identifier: String,
}

impl EpubMetadata {
    /// Metadata with a fresh `urn:uuid` identifier.
    pub fn new(title: impl Into<String>, author: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            author: author.into(),
            language: language.into(),
            identifier: format!("urn:uuid:{}", uuid::Uuid::new_v4()),
        }
    }
}

/// One spine document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpubChapter {
    /// Manifest id.
    pub id: String,
    pub title: String,
    /// Path relative to the package directory.
    pub file_name: String,
    /// Complete XHTML document.
    pub xhtml: String,
}

impl EpubChapter {
    /// Wrap an XHTML body fragment in a full document.
    pub fn from_body(
        id: impl Into<String>,
        title: impl Into<String>,
        file_name: impl Into<String>,
        body: &str,
        language: &str,
    ) -> Self {
        let title = title.into();
        Self {
            id: id.into(),
            xhtml: xhtml_document(&title, language, body),
            title,
            file_name: file_name.into(),
        }
    }
}

/// An in-memory EPUB: metadata plus chapters in reading order.
#[derive(Debug, Clone)]
pub struct EpubDocument {
    pub metadata: EpubMetadata,
    pub chapters: Vec<EpubChapter>,
}

/// Reject output paths that do not end in `.epub`.
pub fn validate_output_path(path: &Path) -> Result<(), ScanError> {
    let is_epub = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("epub"));
    if !is_epub {
        return Err(ScanError::InvalidOutputPath {
            path: path.to_path_buf(),
            reason: "output file must have a .epub extension".into(),
        });
    }
    Ok(())
}

/// Write `doc` to `path` atomically.
pub fn write_epub(doc: &EpubDocument, path: &Path) -> Result<(), ScanError> {
    validate_output_path(path)?;
    if doc.chapters.is_empty() {
        return Err(ScanError::NoContent);
    }

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent).map_err(|e| ScanError::OutputWriteFailed {
        path: parent.clone(),
        source: e,
    })?;

    let tmp = tempfile::NamedTempFile::new_in(&parent).map_err(|e| ScanError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    })?;
    let assembly = |detail: String| ScanError::Assembly {
        path: path.to_path_buf(),
        detail,
    };

    let tmp = write_package(doc, tmp).map_err(|e| assembly(e.to_string()))?;
    tmp.persist(path).map_err(|e| ScanError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e.error,
    })?;

    info!(
        "Wrote EPUB {} ({} chapters)",
        path.display(),
        doc.chapters.len()
    );
    Ok(())
}

fn write_package<W: Write + Seek>(doc: &EpubDocument, sink: W) -> zip::result::ZipResult<W> {
    let mut zip = ZipWriter::new(sink);
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file("mimetype", stored)?;
    zip.write_all(MIMETYPE.as_bytes())?;

    zip.start_file("META-INF/container.xml", deflated)?;
    zip.write_all(container_xml().as_bytes())?;

    let files = chapter_files(&doc.chapters);

    zip.start_file(OPF_PATH, deflated)?;
    zip.write_all(content_opf(doc, &files).as_bytes())?;

    zip.start_file("OEBPS/nav.xhtml", deflated)?;
    zip.write_all(nav_xhtml(doc, &files).as_bytes())?;

    zip.start_file("OEBPS/toc.ncx", deflated)?;
    zip.write_all(toc_ncx(doc, &files).as_bytes())?;

    for (chapter, file) in doc.chapters.iter().zip(&files) {
        zip.start_file(format!("OEBPS/{file}"), deflated)?;
        zip.write_all(chapter.xhtml.as_bytes())?;
    }

    zip.finish()
}

/// Package-relative file names, replacing unsafe or duplicate ones.
fn chapter_files(chapters: &[EpubChapter]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    chapters
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let name = c.file_name.trim();
            let safe = !name.is_empty()
                && !name.starts_with('/')
                && !name.split('/').any(|seg| seg == ".." || seg.is_empty())
                && name != "nav.xhtml"
                && name != "toc.ncx"
                && name != "content.opf";
            if safe && seen.insert(name.to_string()) {
                name.to_string()
            } else {
                let fallback = format!("chapter_{:03}.xhtml", i + 1);
                seen.insert(fallback.clone());
                fallback
            }
        })
        .collect()
}

static RE_XML_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][\w.-]*$").unwrap());

/// Manifest ids: the chapter's own id when it is a valid, unique XML id.
fn chapter_ids(chapters: &[EpubChapter]) -> Vec<String> {
    let mut seen: std::collections::HashSet<String> =
        ["nav", "ncx"].into_iter().map(String::from).collect();
    chapters
        .iter()
        .enumerate()
        .map(|(i, c)| {
            if RE_XML_ID.is_match(&c.id) && seen.insert(c.id.clone()) {
                c.id.clone()
            } else {
                let fallback = format!("chapter_{:03}", i + 1);
                seen.insert(fallback.clone());
                fallback
            }
        })
        .collect()
}

fn container_xml() -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <container version=\"1.0\" xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\">\n\
         <rootfiles>\n\
         <rootfile full-path=\"{OPF_PATH}\" media-type=\"application/oebps-package+xml\"/>\n\
         </rootfiles>\n\
         </container>\n"
    )
}

fn content_opf(doc: &EpubDocument, files: &[String]) -> String {
    let m = &doc.metadata;
    let modified = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let mut manifest = String::new();
    let mut spine = String::new();
    for (id, file) in chapter_ids(&doc.chapters).iter().zip(files) {
        manifest.push_str(&format!(
            "<item id=\"{id}\" href=\"{}\" media-type=\"application/xhtml+xml\"/>\n",
            escape_xml(file)
        ));
        spine.push_str(&format!("<itemref idref=\"{id}\"/>\n"));
    }
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <package xmlns=\"http://www.idpf.org/2007/opf\" version=\"3.0\" unique-identifier=\"bookid\">\n\
         <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\n\
         <dc:identifier id=\"bookid\">{identifier}</dc:identifier>\n\
         <dc:title>{title}</dc:title>\n\
         <dc:creator>{author}</dc:creator>\n\
         <dc:language>{language}</dc:language>\n\
         <meta property=\"dcterms:modified\">{modified}</meta>\n\
         </metadata>\n\
         <manifest>\n\
         <item id=\"nav\" href=\"nav.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\"/>\n\
         <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\"/>\n\
         {manifest}</manifest>\n\
         <spine toc=\"ncx\">\n\
         {spine}</spine>\n\
         </package>\n",
        identifier = escape_xml(&m.identifier),
        title = escape_xml(&m.title),
        author = escape_xml(&m.author),
        language = escape_xml(&m.language),
    )
}

fn nav_xhtml(doc: &EpubDocument, files: &[String]) -> String {
    let mut items = String::new();
    for (chapter, file) in doc.chapters.iter().zip(files) {
        items.push_str(&format!(
            "<li><a href=\"{}\">{}</a></li>\n",
            escape_xml(file),
            escape_xml(&chapter.title)
        ));
    }
    let body = format!("<nav epub:type=\"toc\" id=\"toc\">\n<h1>Contents</h1>\n<ol>\n{items}</ol>\n</nav>\n");
    xhtml_document(&doc.metadata.title, &doc.metadata.language, &body)
}

fn toc_ncx(doc: &EpubDocument, files: &[String]) -> String {
    let mut points = String::new();
    for (i, (chapter, file)) in doc.chapters.iter().zip(files).enumerate() {
        points.push_str(&format!(
            "<navPoint id=\"navpoint-{n}\" playOrder=\"{n}\">\n\
             <navLabel><text>{title}</text></navLabel>\n\
             <content src=\"{src}\"/>\n\
             </navPoint>\n",
            n = i + 1,
            title = escape_xml(&chapter.title),
            src = escape_xml(file),
        ));
    }
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <ncx xmlns=\"http://www.daisy.org/z3986/2005/ncx/\" version=\"2005-1\">\n\
         <head><meta name=\"dtb:uid\" content=\"{uid}\"/></head>\n\
         <docTitle><text>{title}</text></docTitle>\n\
         <navMap>\n{points}</navMap>\n\
         </ncx>\n",
        uid = escape_xml(&doc.metadata.identifier),
        title = escape_xml(&doc.metadata.title),
    )
}

// ── Reading ──────────────────────────────────────────────────────────────────

static RE_ROOTFILE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"full-path\s*=\s*"([^"]+)""#).unwrap());
static RE_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<(?:opf:)?item\s[^>]*>").unwrap());
static RE_ITEMREF: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<(?:opf:)?itemref\s[^>]*>").unwrap());
static RE_ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"([\w:-]+)\s*=\s*"([^"]*)""#).unwrap());
static RE_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<h[1-3]\b[^>]*>(.*?)</h[1-3]>").unwrap());
static RE_TITLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<title\b[^>]*>(.*?)</title>").unwrap());
static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());

fn dc_field(opf: &str, name: &str) -> Option<String> {
    let re = Regex::new(&format!(r"(?is)<dc:{name}\b[^>]*>(.*?)</dc:{name}>")).ok()?;
    re.captures(opf)
        .map(|c| unescape_basic(c[1].trim()))
        .filter(|s| !s.is_empty())
}

fn attrs(tag: &str) -> HashMap<String, String> {
    RE_ATTR
        .captures_iter(tag)
        .map(|c| (c[1].to_string(), unescape_basic(&c[2])))
        .collect()
}

fn unescape_basic(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Read an EPUB's metadata and spine documents.
///
/// The navigation document and non-XHTML spine entries are skipped.
pub fn read_epub(path: &Path) -> Result<EpubDocument, ScanError> {
    let err = |detail: String| ScanError::EpubRead {
        path: path.to_path_buf(),
        detail,
    };

    let file = std::fs::File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ScanError::FileNotFound {
            path: path.to_path_buf(),
        },
        std::io::ErrorKind::PermissionDenied => ScanError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => err(e.to_string()),
    })?;
    let mut archive = ZipArchive::new(file).map_err(|e| err(format!("not a zip archive: {e}")))?;

    let container = read_entry(&mut archive, "META-INF/container.xml").map_err(err)?;
    let opf_path = RE_ROOTFILE
        .captures(&container)
        .map(|c| c[1].to_string())
        .ok_or_else(|| err("container.xml names no rootfile".into()))?;
    let opf = read_entry(&mut archive, &opf_path).map_err(err)?;
    let base = match opf_path.rfind('/') {
        Some(i) => &opf_path[..=i],
        None => "",
    };

    let mut manifest: HashMap<String, HashMap<String, String>> = HashMap::new();
    for m in RE_ITEM.find_iter(&opf) {
        let a = attrs(m.as_str());
        if let Some(id) = a.get("id").cloned() {
            manifest.insert(id, a);
        }
    }

    let metadata = EpubMetadata {
        title: dc_field(&opf, "title").unwrap_or_else(|| file_stem(path)),
        author: dc_field(&opf, "creator").unwrap_or_else(|| "Unknown".into()),
        language: dc_field(&opf, "language").unwrap_or_else(|| "en".into()),
        identifier: dc_field(&opf, "identifier")
            .unwrap_or_else(|| format!("urn:uuid:{}", uuid::Uuid::new_v4())),
    };

    let mut chapters = Vec::new();
    for m in RE_ITEMREF.find_iter(&opf) {
        let Some(idref) = attrs(m.as_str()).get("idref").cloned() else {
            continue;
        };
        let Some(item) = manifest.get(&idref) else {
            warn!("Spine entry '{}' is not in the manifest", idref);
            continue;
        };
        let is_nav = item
            .get("properties")
            .is_some_and(|p| p.split_whitespace().any(|p| p == "nav"));
        let is_xhtml = item
            .get("media-type")
            .is_some_and(|t| t == "application/xhtml+xml" || t == "text/html");
        if is_nav || !is_xhtml {
            debug!("Skipping spine entry '{}'", idref);
            continue;
        }
        let Some(href) = item.get("href") else {
            continue;
        };
        let href = href.split('#').next().unwrap_or(href);
        let xhtml = read_entry(&mut archive, &format!("{base}{href}")).map_err(err)?;
        let title = chapter_title(&xhtml).unwrap_or_else(|| format!("Chapter {}", chapters.len() + 1));
        chapters.push(EpubChapter {
            id: idref,
            title,
            file_name: href.to_string(),
            xhtml,
        });
    }

    info!(
        "Read EPUB '{}' ({} spine documents)",
        metadata.title,
        chapters.len()
    );
    Ok(EpubDocument { metadata, chapters })
}

fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<String, String> {
    let mut entry = archive
        .by_name(name)
        .map_err(|e| format!("missing entry '{name}': {e}"))?;
    let mut s = String::new();
    entry
        .read_to_string(&mut s)
        .map_err(|e| format!("unreadable entry '{name}': {e}"))?;
    Ok(s)
}

fn chapter_title(xhtml: &str) -> Option<String> {
    [&RE_HEADING, &RE_TITLE].iter().find_map(|re| {
        re.captures(xhtml)
            .map(|c| unescape_basic(RE_TAGS.replace_all(&c[1], "").trim()))
            .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|t| !t.is_empty())
    })
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Untitled")
        .to_string()
}
