//! Embedded post metadata.
//!
//! A [`Post`] is stored as JSON inside a one-element XML document,
//! `<PostMetadata>{json}</PostMetadata>`, which is written as the image's XMP
//! packet:
//! 1. PNG: an uncompressed `iTXt` chunk with keyword `XML:com.adobe.xmp`,
//!    placed right after `IHDR`
//! 2. JPEG: an `APP1` segment with the Adobe XMP namespace header, placed
//!    after `SOI` (and after a leading JFIF `APP0`)
//! 3. WebP: an `XMP ` chunk in the extended format, with a `VP8X` header
//!    synthesized when the encoder produced a simple file
//!
//! Reading sniffs the container, pulls the packet back out and looks for the
//! first `PostMetadata` element anywhere inside it.

use std::borrow::Cow;
use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, ImageFormat};
use quick_xml::escape::{escape, unescape};
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use crate::booru::post::Post;

pub const ROOT_ELEMENT: &str = "PostMetadata";
pub const XMP_KEYWORD: &str = "XML:com.adobe.xmp";

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_XMP_HEADER: &[u8] = b"http://ns.adobe.com/xap/1.0/\0";
const JPEG_MAX_SEGMENT: usize = u16::MAX as usize;

const WEBP_FLAG_XMP: u8 = 0x04;
const WEBP_FLAG_ALPHA: u8 = 0x10;

/// Error types for metadata embedding and extraction
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("XML escape error: {0}")]
    Escape(#[from] quick_xml::escape::EscapeError),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Metadata packet of {0} bytes does not fit in the container")]
    TooLarge(usize),

    #[error("Malformed container: {0}")]
    Malformed(&'static str),

    #[error("No post metadata found")]
    Missing,
}

/// Result type for metadata operations
pub type MetadataResult<T> = Result<T, MetadataError>;

/// Serializes a post into the metadata XML document.
pub fn to_xml(post: &Post) -> MetadataResult<String> {
    let json = serde_json::to_string(post)?;
    Ok(format!("<{0}>{1}</{0}>", ROOT_ELEMENT, escape(json.as_str())))
}

/// Finds the first `PostMetadata` element and decodes the post it carries.
pub fn from_xml(xml: &str) -> MetadataResult<Post> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event()? {
            Event::Start(start) if start.local_name().as_ref() == ROOT_ELEMENT.as_bytes() => {
                let raw = reader.read_text(start.name())?;
                let json = unescape(&raw)?;
                return Ok(serde_json::from_str(&json)?);
            }
            Event::Eof => return Err(MetadataError::Missing),
            _ => {}
        }
    }
}

/// Picks the container from a destination's extension.
pub fn format_for_path(path: &Path) -> MetadataResult<ImageFormat> {
    match ImageFormat::from_path(path) {
        Ok(format @ (ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::WebP)) => Ok(format),
        _ => Err(MetadataError::UnsupportedFormat(path.display().to_string())),
    }
}

/// Encodes `image` as `format` and embeds `post` into the result.
///
/// JPEG output drops any alpha channel.
pub fn encode_with_metadata(image: &DynamicImage, format: ImageFormat, post: &Post) -> MetadataResult<Vec<u8>> {
    let packet = to_xml(post)?;

    let (prepared, has_alpha) = match format {
        ImageFormat::Png => (Cow::Borrowed(image), image.color().has_alpha()),
        ImageFormat::Jpeg => (Cow::Owned(DynamicImage::ImageRgb8(image.to_rgb8())), false),
        ImageFormat::WebP if image.color().has_alpha() => {
            (Cow::Owned(DynamicImage::ImageRgba8(image.to_rgba8())), true)
        }
        ImageFormat::WebP => (Cow::Owned(DynamicImage::ImageRgb8(image.to_rgb8())), false),
        other => return Err(MetadataError::UnsupportedFormat(format!("{:?}", other))),
    };

    let mut encoded = Cursor::new(Vec::new());
    prepared.write_to(&mut encoded, format)?;

    embed_packet(
        format,
        &encoded.into_inner(),
        &packet,
        (image.width(), image.height()),
        has_alpha,
    )
}

/// Inserts an XMP packet into already encoded image bytes.
pub fn embed_packet(
    format: ImageFormat,
    bytes: &[u8],
    packet: &str,
    canvas: (u32, u32),
    has_alpha: bool,
) -> MetadataResult<Vec<u8>> {
    match format {
        ImageFormat::Png => embed_png(bytes, packet),
        ImageFormat::Jpeg => embed_jpeg(bytes, packet),
        ImageFormat::WebP => embed_webp(bytes, packet, canvas, has_alpha),
        other => Err(MetadataError::UnsupportedFormat(format!("{:?}", other))),
    }
}

/// Returns the XMP packet of a PNG, JPEG or WebP file, if it has one.
pub fn extract_packet(bytes: &[u8]) -> MetadataResult<Option<String>> {
    match image::guess_format(bytes)? {
        ImageFormat::Png => extract_png(bytes),
        ImageFormat::Jpeg => extract_jpeg(bytes),
        ImageFormat::WebP => extract_webp(bytes),
        other => Err(MetadataError::UnsupportedFormat(format!("{:?}", other))),
    }
}

/// Reconstructs the post embedded in an image file.
pub fn extract_post(bytes: &[u8]) -> MetadataResult<Post> {
    let packet = extract_packet(bytes)?.ok_or(MetadataError::Missing)?;
    from_xml(&packet)
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

struct PngChunk<'a> {
    kind: [u8; 4],
    data: &'a [u8],
    /// Offset just past the CRC.
    end: usize,
}

fn png_chunk(bytes: &[u8], offset: usize) -> MetadataResult<PngChunk<'_>> {
    let header = bytes
        .get(offset..offset + 8)
        .ok_or(MetadataError::Malformed("truncated PNG chunk header"))?;
    let length = be_u32(header) as usize;
    let kind = [header[4], header[5], header[6], header[7]];

    let start = offset + 8;
    let data = bytes
        .get(start..start + length)
        .ok_or(MetadataError::Malformed("truncated PNG chunk"))?;
    let end = start + length + 4;
    if end > bytes.len() {
        return Err(MetadataError::Malformed("truncated PNG chunk CRC"));
    }

    Ok(PngChunk { kind, data, end })
}

fn embed_png(bytes: &[u8], packet: &str) -> MetadataResult<Vec<u8>> {
    if !bytes.starts_with(&PNG_SIGNATURE) {
        return Err(MetadataError::Malformed("missing PNG signature"));
    }
    let ihdr = png_chunk(bytes, PNG_SIGNATURE.len())?;
    if &ihdr.kind != b"IHDR" {
        return Err(MetadataError::Malformed("PNG does not start with IHDR"));
    }

    // keyword, NUL, compression flag, compression method, empty language, empty translation
    let mut data = Vec::with_capacity(XMP_KEYWORD.len() + 5 + packet.len());
    data.extend_from_slice(XMP_KEYWORD.as_bytes());
    data.extend_from_slice(&[0, 0, 0, 0, 0]);
    data.extend_from_slice(packet.as_bytes());

    let length = u32::try_from(data.len()).map_err(|_| MetadataError::TooLarge(packet.len()))?;

    let mut chunk = Vec::with_capacity(data.len() + 12);
    chunk.extend_from_slice(&length.to_be_bytes());
    chunk.extend_from_slice(b"iTXt");
    chunk.extend_from_slice(&data);
    let crc = crc32fast::hash(&chunk[4..]);
    chunk.extend_from_slice(&crc.to_be_bytes());

    let mut out = Vec::with_capacity(bytes.len() + chunk.len());
    out.extend_from_slice(&bytes[..ihdr.end]);
    out.extend_from_slice(&chunk);
    out.extend_from_slice(&bytes[ihdr.end..]);
    Ok(out)
}

fn extract_png(bytes: &[u8]) -> MetadataResult<Option<String>> {
    let mut offset = PNG_SIGNATURE.len();
    while offset < bytes.len() {
        let chunk = png_chunk(bytes, offset)?;
        match &chunk.kind {
            b"IEND" => break,
            b"iTXt" => {
                if let Some(packet) = png_itxt_packet(chunk.data)? {
                    return Ok(Some(packet));
                }
            }
            _ => {}
        }
        offset = chunk.end;
    }
    Ok(None)
}

fn png_itxt_packet(data: &[u8]) -> MetadataResult<Option<String>> {
    let mut parts = data.splitn(2, |b| *b == 0);
    let keyword = parts.next().unwrap_or_default();
    if keyword != XMP_KEYWORD.as_bytes() {
        return Ok(None);
    }

    let rest = parts.next().ok_or(MetadataError::Malformed("truncated iTXt"))?;
    let (&compressed, rest) = rest
        .split_first()
        .ok_or(MetadataError::Malformed("truncated iTXt"))?;
    if compressed != 0 {
        return Err(MetadataError::Malformed("compressed XMP packet"));
    }

    // skip compression method, language tag and translated keyword
    let rest = rest.get(1..).ok_or(MetadataError::Malformed("truncated iTXt"))?;
    let mut fields = rest.splitn(3, |b| *b == 0);
    let _language = fields.next();
    let _translated = fields.next();
    let text = fields.next().ok_or(MetadataError::Malformed("truncated iTXt"))?;

    Ok(Some(String::from_utf8_lossy(text).into_owned()))
}

fn embed_jpeg(bytes: &[u8], packet: &str) -> MetadataResult<Vec<u8>> {
    if !bytes.starts_with(&[0xFF, 0xD8]) {
        return Err(MetadataError::Malformed("missing JPEG SOI"));
    }

    let segment_length = 2 + JPEG_XMP_HEADER.len() + packet.len();
    if segment_length > JPEG_MAX_SEGMENT {
        return Err(MetadataError::TooLarge(packet.len()));
    }

    let mut insert_at = 2;
    if bytes.get(2..4) == Some(&[0xFF, 0xE0][..]) {
        let length = bytes
            .get(4..6)
            .map(|l| u16::from_be_bytes([l[0], l[1]]) as usize)
            .ok_or(MetadataError::Malformed("truncated APP0"))?;
        if bytes.get(6..11) == Some(&b"JFIF\0"[..]) {
            insert_at = 4 + length;
        }
    }
    if insert_at > bytes.len() {
        return Err(MetadataError::Malformed("truncated APP0"));
    }

    let mut out = Vec::with_capacity(bytes.len() + segment_length + 2);
    out.extend_from_slice(&bytes[..insert_at]);
    out.extend_from_slice(&[0xFF, 0xE1]);
    out.extend_from_slice(&(segment_length as u16).to_be_bytes());
    out.extend_from_slice(JPEG_XMP_HEADER);
    out.extend_from_slice(packet.as_bytes());
    out.extend_from_slice(&bytes[insert_at..]);
    Ok(out)
}

fn extract_jpeg(bytes: &[u8]) -> MetadataResult<Option<String>> {
    let mut offset = 2;
    loop {
        // fill bytes may precede a marker
        while bytes.get(offset) == Some(&0xFF) && bytes.get(offset + 1) == Some(&0xFF) {
            offset += 1;
        }

        let marker = match bytes.get(offset..offset + 2) {
            Some([0xFF, marker]) => *marker,
            _ => return Ok(None),
        };

        match marker {
            // start of scan or end of image: no more metadata segments
            0xDA | 0xD9 => return Ok(None),
            0x01 | 0xD0..=0xD7 => {
                offset += 2;
                continue;
            }
            _ => {}
        }

        let length = bytes
            .get(offset + 2..offset + 4)
            .map(|l| u16::from_be_bytes([l[0], l[1]]) as usize)
            .ok_or(MetadataError::Malformed("truncated JPEG segment"))?;
        let payload = bytes
            .get(offset + 4..offset + 2 + length)
            .ok_or(MetadataError::Malformed("truncated JPEG segment"))?;

        if marker == 0xE1 {
            if let Some(packet) = payload.strip_prefix(JPEG_XMP_HEADER) {
                return Ok(Some(String::from_utf8_lossy(packet).into_owned()));
            }
        }

        offset += 2 + length;
    }
}

fn riff_chunks(bytes: &[u8]) -> MetadataResult<Vec<([u8; 4], &[u8])>> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WEBP" {
        return Err(MetadataError::Malformed("missing RIFF/WEBP header"));
    }
    let end = (8 + le_u32(&bytes[4..8]) as usize).min(bytes.len());

    let mut chunks = Vec::new();
    let mut offset = 12;
    while offset + 8 <= end {
        let fourcc = [bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]];
        let size = le_u32(&bytes[offset + 4..offset + 8]) as usize;
        let data = bytes
            .get(offset + 8..offset + 8 + size)
            .ok_or(MetadataError::Malformed("truncated WebP chunk"))?;
        chunks.push((fourcc, data));
        offset += 8 + size + (size & 1);
    }
    Ok(chunks)
}

fn vp8x(flags: u8, canvas: (u32, u32)) -> Vec<u8> {
    let width = canvas.0.saturating_sub(1);
    let height = canvas.1.saturating_sub(1);
    let mut data = vec![flags, 0, 0, 0];
    data.extend_from_slice(&width.to_le_bytes()[..3]);
    data.extend_from_slice(&height.to_le_bytes()[..3]);
    data
}

fn embed_webp(bytes: &[u8], packet: &str, canvas: (u32, u32), has_alpha: bool) -> MetadataResult<Vec<u8>> {
    let chunks = riff_chunks(bytes)?;
    let mut flags = WEBP_FLAG_XMP;
    if has_alpha {
        flags |= WEBP_FLAG_ALPHA;
    }

    let mut out_chunks: Vec<([u8; 4], Cow<[u8]>)> = Vec::with_capacity(chunks.len() + 2);
    match chunks.first() {
        Some((fourcc, data)) if fourcc == b"VP8X" && !data.is_empty() => {
            let mut header = data.to_vec();
            header[0] |= flags;
            out_chunks.push((*b"VP8X", Cow::Owned(header)));
        }
        _ => out_chunks.push((*b"VP8X", Cow::Owned(vp8x(flags, canvas)))),
    }

    for (fourcc, data) in chunks {
        if &fourcc == b"VP8X" || &fourcc == b"XMP " {
            continue;
        }
        out_chunks.push((fourcc, Cow::Borrowed(data)));
    }
    out_chunks.push((*b"XMP ", Cow::Borrowed(packet.as_bytes())));

    let mut out = Vec::with_capacity(bytes.len() + packet.len() + 32);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(b"WEBP");
    for (fourcc, data) in &out_chunks {
        let size = u32::try_from(data.len()).map_err(|_| MetadataError::TooLarge(packet.len()))?;
        out.extend_from_slice(fourcc);
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(0);
        }
    }

    let riff_size = u32::try_from(out.len() - 8).map_err(|_| MetadataError::TooLarge(packet.len()))?;
    out[4..8].copy_from_slice(&riff_size.to_le_bytes());
    Ok(out)
}

fn extract_webp(bytes: &[u8]) -> MetadataResult<Option<String>> {
    Ok(riff_chunks(bytes)?
        .into_iter()
        .find(|(fourcc, _)| fourcc == b"XMP ")
        .map(|(_, data)| String::from_utf8_lossy(data).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booru::post::{Dimensions, Media, Rating};
    use crate::booru::tags::TagCollection;
    use image::{GenericImageView, ImageBuffer, Rgb, Rgba};

    fn sample_post() -> Post {
        Post {
            source: "booru_downloader::booru::sources::e621::E621".to_string(),
            id: 1234,
            score: -3,
            rating: Rating::Questionable,
            tags: TagCollection::from_categories([
                ("General", vec!["a<b", "fish&chips", "\"quoted\""]),
                ("Artist", vec!["someone"]),
            ]),
            hash: Some("d41d8cd98f00b204e9800998ecf8427e".to_string()),
            media: vec![Media::new("https://static.test/a.png?x=1&y=2", true, Dimensions::new(8, 6))],
        }
    }

    fn rgba_image() -> DynamicImage {
        DynamicImage::ImageRgba8(ImageBuffer::from_pixel(8, 6, Rgba([10u8, 20, 30, 128])))
    }

    fn rgb_image() -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_pixel(8, 6, Rgb([10u8, 20, 30])))
    }

    #[test]
    fn test_xml_escapes_markup_in_tags() {
        let post = sample_post();
        let xml = to_xml(&post).unwrap();
        assert!(xml.starts_with("<PostMetadata>"));
        assert!(!xml.contains("a<b"));
        assert_eq!(from_xml(&xml).unwrap(), post);
    }

    #[test]
    fn test_xml_element_found_inside_larger_packet() {
        let post = sample_post();
        let wrapped = format!(
            "<?xpacket begin=\"\"?><x:xmpmeta xmlns:x=\"adobe:ns:meta/\"><other>1</other>{}</x:xmpmeta>",
            to_xml(&post).unwrap()
        );
        assert_eq!(from_xml(&wrapped).unwrap(), post);
        assert!(matches!(from_xml("<Other>x</Other>"), Err(MetadataError::Missing)));
    }

    #[test]
    fn test_png_round_trip() {
        let post = sample_post();
        let bytes = encode_with_metadata(&rgba_image(), ImageFormat::Png, &post).unwrap();
        assert_eq!(extract_post(&bytes).unwrap(), post);

        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (8, 6));
    }

    #[test]
    fn test_jpeg_round_trip_drops_alpha() {
        let post = sample_post();
        let bytes = encode_with_metadata(&rgba_image(), ImageFormat::Jpeg, &post).unwrap();
        assert_eq!(extract_post(&bytes).unwrap(), post);

        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (8, 6));
        assert!(!decoded.color().has_alpha());
    }

    #[test]
    fn test_webp_round_trip() {
        let post = sample_post();
        for image in [rgba_image(), rgb_image()] {
            let bytes = encode_with_metadata(&image, ImageFormat::WebP, &post).unwrap();
            assert_eq!(extract_post(&bytes).unwrap(), post);

            let chunks = riff_chunks(&bytes).unwrap();
            assert_eq!(&chunks[0].0, b"VP8X");
            assert_ne!(chunks[0].1[0] & WEBP_FLAG_XMP, 0);
            assert_eq!(le_u32(&bytes[4..8]) as usize, bytes.len() - 8);

            let decoded = image::load_from_memory(&bytes).unwrap();
            assert_eq!(decoded.dimensions(), (8, 6));
        }
    }

    #[test]
    fn test_file_without_metadata() {
        let mut plain = Cursor::new(Vec::new());
        rgb_image().write_to(&mut plain, ImageFormat::Png).unwrap();
        let plain = plain.into_inner();
        assert!(extract_packet(&plain).unwrap().is_none());
        assert!(matches!(extract_post(&plain), Err(MetadataError::Missing)));
        assert!(extract_post(b"definitely not an image").is_err());
    }

    #[test]
    fn test_jpeg_packet_too_large() {
        let mut jpeg = Cursor::new(Vec::new());
        rgb_image().write_to(&mut jpeg, ImageFormat::Jpeg).unwrap();
        let packet = "x".repeat(70_000);
        let result = embed_packet(ImageFormat::Jpeg, &jpeg.into_inner(), &packet, (8, 6), false);
        assert!(matches!(result, Err(MetadataError::TooLarge(70_000))));
    }

    #[test]
    fn test_format_for_path() {
        assert_eq!(format_for_path(Path::new("a/b.PNG")).unwrap(), ImageFormat::Png);
        assert_eq!(format_for_path(Path::new("b.jpeg")).unwrap(), ImageFormat::Jpeg);
        assert_eq!(format_for_path(Path::new("b.webp")).unwrap(), ImageFormat::WebP);
        assert!(matches!(
            format_for_path(Path::new("b.gif")),
            Err(MetadataError::UnsupportedFormat(_))
        ));
        assert!(format_for_path(Path::new("noext")).is_err());
    }
}
