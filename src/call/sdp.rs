//! Payload-type filtering of SDP offers. The body is otherwise opaque:
//! lines are matched textually and kept byte for byte.

/// Drops payload types not in `allowed` from every `m=` line, along with
/// their `a=rtpmap` and `a=fmtp` lines. Returns `None` when nothing had to
/// change, so the caller keeps the original body.
///
/// A media line left without any format is kept with port 0, which
/// rejects the stream without breaking the line order of the offer.
pub fn filter_payload_types(body: &[u8], allowed: &[u32]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(body).ok()?;
    let mut changed = false;
    let mut removed: Vec<u32> = Vec::new();
    let mut out = String::with_capacity(text.len());

    // first pass: m= lines
    let mut lines: Vec<String> = Vec::new();
    for line in text.split_inclusive('\n') {
        let (content, ending) = split_ending(line);
        match content.strip_prefix("m=") {
            Some(media) => {
                let Some(filtered) = filter_media(media, allowed, &mut removed) else {
                    lines.push(line.to_string());
                    continue;
                };
                changed = true;
                lines.push(format!("m={}{}", filtered, ending));
            }
            None => lines.push(line.to_string()),
        }
    }
    if !changed {
        return None;
    }

    for line in &lines {
        let (content, _) = split_ending(line);
        if let Some(pt) = attribute_payload_type(content) {
            if removed.contains(&pt) {
                continue;
            }
        }
        out.push_str(line);
    }
    Some(out.into_bytes())
}

fn split_ending(line: &str) -> (&str, &str) {
    let content = line.trim_end_matches(['\r', '\n']);
    (content, &line[content.len()..])
}

/// `m=<media> <port> <proto> <fmt> ...` with disallowed RTP/AVP formats
/// removed, `None` if the line stays as is.
fn filter_media(media: &str, allowed: &[u32], removed: &mut Vec<u32>) -> Option<String> {
    let mut fields = media.split(' ');
    let kind = fields.next()?;
    let port = fields.next()?;
    let proto = fields.next()?;
    if !proto.starts_with("RTP/") {
        return None;
    }
    let formats: Vec<&str> = fields.filter(|f| !f.is_empty()).collect();
    let mut kept: Vec<&str> = Vec::with_capacity(formats.len());
    for fmt in &formats {
        match fmt.parse::<u32>() {
            Ok(pt) if !allowed.contains(&pt) => removed.push(pt),
            _ => kept.push(fmt),
        }
    }
    if kept.len() == formats.len() {
        return None;
    }
    if kept.is_empty() {
        // RFC 3264 §6: a rejected stream keeps one format
        return Some(format!("{} 0 {} {}", kind, proto, formats[0]));
    }
    Some(format!("{} {} {} {}", kind, port, proto, kept.join(" ")))
}

/// Payload type of an `a=rtpmap:` or `a=fmtp:` line.
fn attribute_payload_type(line: &str) -> Option<u32> {
    let value = line
        .strip_prefix("a=rtpmap:")
        .or_else(|| line.strip_prefix("a=fmtp:"))?;
    value.split(' ').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 1 1 IN IP4 10.0.0.1\r\n\
s=-\r\n\
c=IN IP4 10.0.0.1\r\n\
t=0 0\r\n\
m=audio 10000 RTP/AVP 0 9 101\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:9 G722/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\n\
a=fmtp:101 0-15\r\n";

    #[test]
    fn test_removes_disallowed_formats() {
        let filtered = filter_payload_types(OFFER.as_bytes(), &[0, 8, 18, 100, 101]).unwrap();
        let filtered = String::from_utf8(filtered).unwrap();
        assert!(filtered.contains("m=audio 10000 RTP/AVP 0 101\r\n"));
        assert!(!filtered.contains("G722"));
        assert!(filtered.contains("a=fmtp:101 0-15\r\n"));
        assert!(filtered.starts_with("v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\n"));
    }

    #[test]
    fn test_untouched_offer() {
        assert!(filter_payload_types(OFFER.as_bytes(), &[0, 9, 101]).is_none());
        assert!(filter_payload_types(b"m=image 9000 udptl t38\n", &[0]).is_none());
        assert!(filter_payload_types(&[0xff, 0xfe], &[0]).is_none());
    }

    #[test]
    fn test_rejects_stream_without_formats() {
        let offer = "v=0\nm=audio 10000 RTP/AVP 9\na=rtpmap:9 G722/8000\n";
        let filtered = filter_payload_types(offer.as_bytes(), &[0]).unwrap();
        assert_eq!(
            String::from_utf8(filtered).unwrap(),
            "v=0\nm=audio 0 RTP/AVP 9\n"
        );
    }
}
