//! vCard to row conversion.
//!
//! Only the projected properties are lifted out of the source card into a
//! minimal vCard 4.0 document, which is then parsed by `vcard4`. This lets
//! 3.0 cards from older servers through without tripping over parameters the
//! 4.0 grammar rejects.

use vcard4::property::{TextListProperty, TextOrUriProperty};
use vcard4::{parse, Vcard};

use crate::row::{Row, RowKey};

const BEGIN_VCARD: &str = "BEGIN:VCARD";
const END_VCARD: &str = "END:VCARD";

/// Properties carried into the normalized card.
const PROJECTED: [&str; 6] = ["FN", "N", "TEL", "EMAIL", "ORG", "UID"];

/// Placeholder FN for cards that have none; 4.0 requires the property.
const PLACEHOLDER_FN: &str = "unnamed";

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("no BEGIN:VCARD block found")]
    NotACard,
    #[error("unterminated vCard (missing END:VCARD)")]
    Unterminated,
    #[error("invalid vCard: {0}")]
    Parse(String),
}

/// Convert one vCard resource into a row.
///
/// Returns `Ok(None)` for blank input and for cards without any projected
/// data. `fallback_key` identifies the row when the card has no UID.
pub fn card_to_row(raw: &str, fallback_key: &str) -> Result<Option<Row>, ConvertError> {
    if raw.trim().is_empty() {
        return Ok(None);
    }

    let block = first_card_block(raw)?;
    let normalized = normalize_card(&block);
    let card = parse(&normalized.text)
        .map_err(|err| ConvertError::Parse(err.to_string()))?
        .into_iter()
        .next()
        .ok_or_else(|| ConvertError::Parse("card vanished during parsing".to_string()))?;

    let key = card_uid(&card)
        .and_then(|uid| RowKey::id(&uid))
        .or_else(|| RowKey::id(fallback_key));
    let Some(key) = key else {
        return Ok(None);
    };

    let full_name = if normalized.has_fn {
        card.formatted_name
            .first()
            .map(|prop| plain_text(&prop.value))
            .unwrap_or_default()
    } else {
        card.name.as_ref().map(name_to_display_string).unwrap_or_default()
    };

    let phone = card.tel.first().map(tel_value).unwrap_or_default();
    let email = card
        .email
        .first()
        .map(|prop| plain_text(&prop.value))
        .unwrap_or_default();
    let organization = card.org.first().map(org_value).unwrap_or_default();

    let row = Row::new(key, [full_name, phone, email, organization]);
    if row.is_empty() {
        Ok(None)
    } else {
        Ok(Some(row))
    }
}

fn first_card_block(raw: &str) -> Result<Vec<String>, ConvertError> {
    let mut lines = raw.lines().map(|line| line.trim_end_matches('\r'));
    if !lines.any(|line| line.trim().eq_ignore_ascii_case(BEGIN_VCARD)) {
        return Err(ConvertError::NotACard);
    }

    let mut block = Vec::new();
    for line in lines {
        if line.trim().eq_ignore_ascii_case(END_VCARD) {
            return Ok(block);
        }
        block.push(line.to_string());
    }
    Err(ConvertError::Unterminated)
}

struct NormalizedCard {
    text: String,
    has_fn: bool,
}

fn normalize_card(block: &[String]) -> NormalizedCard {
    let mut output = vec![BEGIN_VCARD.to_string(), "VERSION:4.0".to_string()];
    let mut has_fn = false;

    for line in unfold_lines(block) {
        let Some((lhs, value)) = line.split_once(':') else {
            continue;
        };
        let mut params = lhs.split(';');
        let property = params.next().unwrap_or_default();
        let name = property
            .rsplit_once('.')
            .map(|(_, name)| name)
            .unwrap_or(property)
            .trim()
            .to_ascii_uppercase();
        if !PROJECTED.contains(&name.as_str()) {
            continue;
        }

        let quoted_printable = params.any(is_quoted_printable_param);
        let value = if quoted_printable {
            decode_quoted_printable(value).replace(['\r', '\n'], " ")
        } else {
            value.to_string()
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        if name == "FN" {
            has_fn = true;
        }
        output.push(format!("{name}:{value}"));
    }

    if !has_fn {
        output.push(format!("FN:{PLACEHOLDER_FN}"));
    }
    output.push(END_VCARD.to_string());

    NormalizedCard {
        text: output.join("\r\n") + "\r\n",
        has_fn,
    }
}

fn unfold_lines(lines: &[String]) -> Vec<String> {
    let mut unfolded: Vec<String> = Vec::new();
    for line in lines {
        let mut handled = false;
        if let Some(last) = unfolded.last_mut() {
            if line.starts_with(' ') || line.starts_with('\t') {
                if last.ends_with('=') && has_quoted_printable_encoding(last) {
                    last.pop();
                }
                last.push_str(&line[1..]);
                handled = true;
            } else if last.ends_with('=') && has_quoted_printable_encoding(last) {
                last.pop();
                last.push_str(line);
                handled = true;
            }
        }

        if !handled {
            unfolded.push(line.clone());
        }
    }
    unfolded
}

fn has_quoted_printable_encoding(line: &str) -> bool {
    line.split_once(':')
        .map(|(lhs, _)| lhs.split(';').skip(1).any(is_quoted_printable_param))
        .unwrap_or(false)
}

fn is_quoted_printable_param(param: &str) -> bool {
    let param = param.trim();
    match param.split_once('=') {
        Some((name, value)) => {
            name.trim().eq_ignore_ascii_case("ENCODING")
                && value.trim().eq_ignore_ascii_case("QUOTED-PRINTABLE")
        }
        None => param.eq_ignore_ascii_case("QUOTED-PRINTABLE"),
    }
}

/// Decode a quoted-printable value. Malformed escapes are kept literally.
fn decode_quoted_printable(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'=' {
            let hex = bytes
                .get(idx + 1..idx + 3)
                .and_then(|pair| std::str::from_utf8(pair).ok())
                .and_then(|pair| u8::from_str_radix(pair, 16).ok());
            match hex {
                Some(byte) => {
                    decoded.push(byte);
                    idx += 3;
                    continue;
                }
                None if idx + 1 == bytes.len() => break,
                None => {}
            }
        }
        decoded.push(bytes[idx]);
        idx += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn card_uid(card: &Vcard) -> Option<String> {
    match &card.uid {
        Some(TextOrUriProperty::Text(text)) => Some(text.value.clone()),
        Some(TextOrUriProperty::Uri(uri)) => Some(uri.value.to_string()),
        None => None,
    }
}

fn tel_value(prop: &TextOrUriProperty) -> String {
    let raw = match prop {
        TextOrUriProperty::Text(text) => text.value.clone(),
        TextOrUriProperty::Uri(uri) => uri.value.to_string(),
    };
    let trimmed = raw.trim();
    let number = match trimmed.get(..4) {
        Some(scheme) if scheme.eq_ignore_ascii_case("tel:") => &trimmed[4..],
        _ => trimmed,
    };
    plain_text(number)
}

fn org_value(prop: &TextListProperty) -> String {
    prop.value
        .iter()
        .map(|part| plain_text(part))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render N as "prefix given additional family suffix", skipping blanks.
fn name_to_display_string(name: &TextListProperty) -> String {
    let component = |idx: usize| name.value.get(idx).map(|s| plain_text(s)).unwrap_or_default();
    let family = component(0);
    let given = component(1);
    let additional = component(2);
    let prefix = component(3);
    let suffix = component(4);

    [prefix, given, additional, family, suffix]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// vcard4 has already decoded escapes; only line breaks need flattening.
fn plain_text(value: &str) -> String {
    value.replace(['\r', '\n'], " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(raw: &str) -> Row {
        card_to_row(raw, "/abook/fallback.vcf")
            .expect("conversion failed")
            .expect("no row produced")
    }

    #[test]
    fn test_v4_card_projection() {
        let row = convert(
            "BEGIN:VCARD\r\nVERSION:4.0\r\nUID:urn:uuid:1234\r\nFN:Alice Smith\r\n\
             TEL;TYPE=cell:+1 555 1111\r\nTEL:+1 555 9999\r\nEMAIL:alice@example.com\r\n\
             ORG:ACME;Research\r\nEND:VCARD\r\n",
        );
        assert_eq!(row.key(), &RowKey::Id("urn:uuid:1234".to_string()));
        assert_eq!(
            row.fields(),
            ["Alice Smith", "+1 555 1111", "alice@example.com", "ACME, Research"]
        );
    }

    #[test]
    fn test_v3_card_with_groups_and_params() {
        let row = convert(
            "BEGIN:VCARD\nVERSION:3.0\nUID:bob-1\nN:Builder;Bob;;;\nFN:Bob Builder\n\
             item1.EMAIL;type=INTERNET;type=pref:bob@example.com\n\
             TEL;type=CELL;type=VOICE;type=pref:555-3333\n\
             PHOTO;ENCODING=b;TYPE=JPEG:AAAA\nEND:VCARD\n",
        );
        assert_eq!(row.key(), &RowKey::Id("bob-1".to_string()));
        assert_eq!(row.fields(), ["Bob Builder", "555-3333", "bob@example.com", ""]);
    }

    #[test]
    fn test_missing_uid_uses_fallback_key() {
        let row = convert("BEGIN:VCARD\nVERSION:4.0\nFN:Carol\nEND:VCARD\n");
        assert_eq!(row.key(), &RowKey::Id("/abook/fallback.vcf".to_string()));
        assert_eq!(row.fields(), ["Carol", "", "", ""]);
    }

    #[test]
    fn test_name_from_n_when_fn_missing() {
        let row = convert("BEGIN:VCARD\nVERSION:3.0\nN:Doe;Jane;Q;Dr.;\nEND:VCARD\n");
        assert_eq!(row.fields()[0], "Dr. Jane Q Doe");
    }

    #[test]
    fn test_card_without_projected_data_yields_no_row() {
        let result = card_to_row(
            "BEGIN:VCARD\nVERSION:4.0\nUID:empty-1\nNOTE:nothing useful\nEND:VCARD\n",
            "/abook/x.vcf",
        )
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_blank_input_yields_no_row() {
        assert!(card_to_row("  \r\n", "/abook/x.vcf").unwrap().is_none());
    }

    #[test]
    fn test_garbage_is_an_error() {
        let err = card_to_row("<html>not a card</html>", "/abook/x.vcf").unwrap_err();
        assert!(matches!(err, ConvertError::NotACard));

        let err = card_to_row("BEGIN:VCARD\nFN:Half\n", "/abook/x.vcf").unwrap_err();
        assert!(matches!(err, ConvertError::Unterminated));
    }

    #[test]
    fn test_folded_and_quoted_printable_lines() {
        let row = convert(
            "BEGIN:VCARD\nVERSION:2.1\nFN;ENCODING=QUOTED-PRINTABLE:J=C3=BCrgen =\nM=C3=BCller\n\
             EMAIL:juergen.mueller@exa\n mple.com\nEND:VCARD\n",
        );
        assert_eq!(row.fields()[0], "Jürgen Müller");
        assert_eq!(row.fields()[2], "juergen.mueller@example.com");
    }

    #[test]
    fn test_tel_uri_scheme_is_stripped() {
        let row = convert("BEGIN:VCARD\nVERSION:4.0\nFN:Dan\nTEL;VALUE=uri:tel:+1-555-0100\nEND:VCARD\n");
        assert_eq!(row.fields()[1], "+1-555-0100");
    }

    #[test]
    fn test_decode_quoted_printable() {
        assert_eq!(decode_quoted_printable("Line=3D1"), "Line=1");
        assert_eq!(decode_quoted_printable("Trailing="), "Trailing");
        assert_eq!(decode_quoted_printable("Bad=ZZ"), "Bad=ZZ");
    }

    #[test]
    fn test_escaped_backslash_survives() {
        let row = convert("BEGIN:VCARD\nVERSION:3.0\nFN:C:\\\\Users\\\\Jane\nEND:VCARD\n");
        assert_eq!(row.fields()[0], r"C:\Users\Jane");
    }

    #[test]
    fn test_plain_text_flattens_line_breaks() {
        assert_eq!(plain_text("first\nsecond\r\nthird "), "first second  third");
        assert_eq!(plain_text(r"C:\Users"), r"C:\Users");
    }
}
