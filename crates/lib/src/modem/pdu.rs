//! SMS PDU codec: decodes SMS-DELIVER (incoming) and encodes SMS-SUBMIT (outgoing).
//!
//! Supports the GSM 7-bit default alphabet (with extension table), 8-bit data and
//! UCS-2, plus the concatenation information elements (8-bit and 16-bit reference).

use crate::channels::{ConcatHeader, InboundMessage};
use chrono::{DateTime, FixedOffset, Local, NaiveDate, TimeZone};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PduError {
    #[error("pdu truncated")]
    Truncated,
    #[error("invalid hex in pdu")]
    InvalidHex,
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Decoded SMS-DELIVER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverPdu {
    pub sender: String,
    /// Service centre timestamp; None when the PDU carries an invalid date.
    pub timestamp: Option<DateTime<FixedOffset>>,
    pub text: String,
    pub concat: Option<ConcatHeader>,
}

impl DeliverPdu {
    pub fn into_inbound(self, source_channel: &str) -> InboundMessage {
        InboundMessage {
            sender: self.sender,
            received_at: self
                .timestamp
                .map(|t| t.with_timezone(&Local))
                .unwrap_or_else(Local::now),
            text: self.text,
            source_channel: source_channel.to_string(),
            concat: self.concat,
        }
    }
}

/// One encoded SMS-SUBMIT, ready for `AT+CMGS=<tpdu_len>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitPdu {
    /// Length in octets, excluding the SMSC field.
    pub tpdu_len: usize,
    pub hex: String,
}

const ESC: u8 = 0x1B;

const GSM7_BASIC: [char; 128] = [
    '@', '£', '$', '¥', 'è', 'é', 'ù', 'ì', 'ò', 'Ç', '\n', 'Ø', 'ø', '\r', 'Å', 'å', //
    'Δ', '_', 'Φ', 'Γ', 'Λ', 'Ω', 'Π', 'Ψ', 'Σ', 'Θ', 'Ξ', '\u{A0}', 'Æ', 'æ', 'ß', 'É', //
    ' ', '!', '"', '#', '¤', '%', '&', '\'', '(', ')', '*', '+', ',', '-', '.', '/', //
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', ':', ';', '<', '=', '>', '?', //
    '¡', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', //
    'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'Ä', 'Ö', 'Ñ', 'Ü', '§', //
    '¿', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', //
    'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'ä', 'ö', 'ñ', 'ü', 'à', //
];

const GSM7_EXTENSION: [(u8, char); 10] = [
    (0x0A, '\u{0C}'),
    (0x14, '^'),
    (0x28, '{'),
    (0x29, '}'),
    (0x2F, '\\'),
    (0x3C, '['),
    (0x3D, '~'),
    (0x3E, ']'),
    (0x40, '|'),
    (0x65, '€'),
];

const GSM7_SINGLE_MAX: usize = 160;
const GSM7_PART_MAX: usize = 153;
const UCS2_SINGLE_MAX: usize = 70;
const UCS2_PART_MAX: usize = 67;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Alphabet {
    Gsm7,
    EightBit,
    Ucs2,
}

impl Alphabet {
    fn from_dcs(dcs: u8) -> Self {
        match dcs >> 4 {
            0x0..=0x7 => match (dcs >> 2) & 0x03 {
                1 => Alphabet::EightBit,
                2 => Alphabet::Ucs2,
                _ => Alphabet::Gsm7,
            },
            0xE => Alphabet::Ucs2,
            0xF if dcs & 0x04 != 0 => Alphabet::EightBit,
            _ => Alphabet::Gsm7,
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, PduError> {
        let b = *self.bytes.get(self.pos).ok_or(PduError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PduError> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + n)
            .ok_or(PduError::Truncated)?;
        self.pos += n;
        Ok(slice)
    }

    fn rest(&self) -> &'a [u8] {
        self.bytes.get(self.pos..).unwrap_or(&[])
    }
}

pub fn decode_hex(s: &str) -> Result<Vec<u8>, PduError> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err(PduError::InvalidHex);
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            s.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or(PduError::InvalidHex)
        })
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Decode an SMS-DELIVER PDU as printed by the modem (hex, SMSC field included).
pub fn decode_deliver(hex: &str) -> Result<DeliverPdu, PduError> {
    let bytes = decode_hex(hex)?;
    let mut r = Reader::new(&bytes);

    let smsc_len = r.u8()? as usize;
    r.take(smsc_len)?;

    let first = r.u8()?;
    if first & 0x03 != 0x00 {
        return Err(PduError::Unsupported(format!(
            "message type indicator {}",
            first & 0x03
        )));
    }
    let udhi = first & 0x40 != 0;

    let oa_len = r.u8()? as usize;
    let toa = r.u8()?;
    let oa = r.take(oa_len.div_ceil(2))?;
    let sender = decode_address(oa, oa_len, toa)?;

    let _pid = r.u8()?;
    let alphabet = Alphabet::from_dcs(r.u8()?);
    let timestamp = decode_timestamp(r.take(7)?);
    let udl = r.u8()? as usize;
    let ud = r.rest();

    let (header_len, concat) = if udhi {
        let udhl = *ud.first().ok_or(PduError::Truncated)? as usize;
        let header = ud.get(1..1 + udhl).ok_or(PduError::Truncated)?;
        (udhl + 1, parse_concat(header))
    } else {
        (0, None)
    };

    let text = match alphabet {
        Alphabet::Gsm7 => {
            let septets = unpack_septets(ud, udl)?;
            let skip = (header_len * 8).div_ceil(7);
            decode_gsm7(septets.get(skip..).unwrap_or(&[]))
        }
        Alphabet::Ucs2 => decode_ucs2(ud.get(header_len..udl).ok_or(PduError::Truncated)?),
        Alphabet::EightBit => ud
            .get(header_len..udl)
            .ok_or(PduError::Truncated)?
            .iter()
            .map(|&b| b as char)
            .collect(),
    };

    Ok(DeliverPdu {
        sender,
        timestamp,
        text,
        concat,
    })
}

fn decode_address(bytes: &[u8], len: usize, toa: u8) -> Result<String, PduError> {
    if toa & 0x70 == 0x50 {
        let septets = unpack_septets(bytes, len * 4 / 7)?;
        return Ok(decode_gsm7(&septets));
    }
    let mut out = String::with_capacity(len + 1);
    if toa & 0x70 == 0x10 {
        out.push('+');
    }
    for nibble in bytes.iter().flat_map(|b| [b & 0x0F, b >> 4]).take(len) {
        match nibble {
            0..=9 => out.push((b'0' + nibble) as char),
            0xA => out.push('*'),
            0xB => out.push('#'),
            0xC..=0xE => out.push((b'a' + nibble - 0xC) as char),
            _ => {}
        }
    }
    Ok(out)
}

fn swapped_bcd(b: u8) -> u32 {
    u32::from(b & 0x0F) * 10 + u32::from(b >> 4)
}

fn decode_timestamp(b: &[u8]) -> Option<DateTime<FixedOffset>> {
    let [yy, mo, dd, hh, mi, ss, tz] = <[u8; 7]>::try_from(b).ok()?;
    let quarters = i32::from(tz & 0x07) * 10 + i32::from(tz >> 4);
    let seconds = quarters * 15 * 60;
    let offset = FixedOffset::east_opt(if tz & 0x08 != 0 { -seconds } else { seconds })?;
    let naive = NaiveDate::from_ymd_opt(2000 + swapped_bcd(yy) as i32, swapped_bcd(mo), swapped_bcd(dd))?
        .and_hms_opt(swapped_bcd(hh), swapped_bcd(mi), swapped_bcd(ss))?;
    offset.from_local_datetime(&naive).single()
}

fn parse_concat(header: &[u8]) -> Option<ConcatHeader> {
    let mut i = 0;
    while i + 1 < header.len() {
        let iei = header[i];
        let len = header[i + 1] as usize;
        let data = header.get(i + 2..i + 2 + len)?;
        match (iei, data) {
            (0x00, &[reference, total_parts, part_number]) => {
                return Some(ConcatHeader {
                    reference: u16::from(reference),
                    total_parts,
                    part_number,
                })
            }
            (0x08, &[hi, lo, total_parts, part_number]) => {
                return Some(ConcatHeader {
                    reference: u16::from_be_bytes([hi, lo]),
                    total_parts,
                    part_number,
                })
            }
            _ => {}
        }
        i += 2 + len;
    }
    None
}

fn unpack_septets(data: &[u8], count: usize) -> Result<Vec<u8>, PduError> {
    let mut out = Vec::with_capacity(count);
    for n in 0..count {
        let bit = n * 7;
        let byte = bit / 8;
        let lo = u16::from(*data.get(byte).ok_or(PduError::Truncated)?);
        let hi = u16::from(data.get(byte + 1).copied().unwrap_or(0));
        out.push((((lo | (hi << 8)) >> (bit % 8)) & 0x7F) as u8);
    }
    Ok(out)
}

fn pack_septets(septets: &[u8], fill_bits: usize) -> Vec<u8> {
    let total_bits = fill_bits + septets.len() * 7;
    let mut out = vec![0u8; total_bits.div_ceil(8)];
    for (n, &s) in septets.iter().enumerate() {
        let bit = fill_bits + n * 7;
        let shifted = u16::from(s & 0x7F) << (bit % 8);
        out[bit / 8] |= (shifted & 0xFF) as u8;
        if let Some(next) = out.get_mut(bit / 8 + 1) {
            *next |= (shifted >> 8) as u8;
        }
    }
    out
}

fn decode_gsm7(septets: &[u8]) -> String {
    let mut out = String::with_capacity(septets.len());
    let mut escaped = false;
    for &s in septets {
        if escaped {
            escaped = false;
            match GSM7_EXTENSION.iter().find(|(code, _)| *code == s) {
                Some((_, c)) => out.push(*c),
                None => out.push(GSM7_BASIC[usize::from(s & 0x7F)]),
            }
        } else if s == ESC {
            escaped = true;
        } else {
            out.push(GSM7_BASIC[usize::from(s & 0x7F)]);
        }
    }
    out
}

fn decode_ucs2(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Septets for one character, or None when it is outside the GSM alphabet.
fn gsm7_char(c: char) -> Option<Vec<u8>> {
    if c != '\u{A0}' {
        if let Some(pos) = GSM7_BASIC.iter().position(|&b| b == c) {
            return Some(vec![pos as u8]);
        }
    }
    GSM7_EXTENSION
        .iter()
        .find(|(_, ext)| *ext == c)
        .map(|(code, _)| vec![ESC, *code])
}

/// Group per-character code units into parts without splitting a character.
fn split_units(groups: Vec<Vec<u8>>, single_max: usize, part_max: usize) -> Vec<Vec<u8>> {
    let total: usize = groups.iter().map(Vec::len).sum();
    if total <= single_max {
        return vec![groups.concat()];
    }
    let mut parts = Vec::new();
    let mut current = Vec::new();
    for group in groups {
        if current.len() + group.len() > part_max {
            parts.push(std::mem::take(&mut current));
        }
        current.extend(group);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn semi_octets(digits: &[u8]) -> Vec<u8> {
    digits
        .chunks(2)
        .map(|pair| {
            let lo = pair[0] - b'0';
            let hi = pair.get(1).map(|d| d - b'0').unwrap_or(0x0F);
            (hi << 4) | lo
        })
        .collect()
}

/// Encode `text` for `destination` as one or more SMS-SUBMIT PDUs. Text that fits the
/// GSM alphabet uses 7-bit packing, anything else UCS-2. Long text is split into
/// concatenated parts sharing `reference`.
pub fn encode_submit(destination: &str, text: &str, reference: u8) -> Result<Vec<SubmitPdu>, PduError> {
    let (international, digits) = match destination.trim().strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, destination.trim()),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) || digits.len() > 20 {
        return Err(PduError::Unsupported(format!("destination {}", destination)));
    }

    let gsm_groups: Option<Vec<Vec<u8>>> = text.chars().map(gsm7_char).collect();
    let (dcs, parts) = match gsm_groups {
        Some(groups) => (0x00, split_units(groups, GSM7_SINGLE_MAX, GSM7_PART_MAX)),
        None => {
            let groups = text
                .chars()
                .map(|c| {
                    let mut buf = [0u16; 2];
                    c.encode_utf16(&mut buf)
                        .iter()
                        .flat_map(|u| u.to_be_bytes())
                        .collect()
                })
                .collect();
            (0x08, split_units(groups, UCS2_SINGLE_MAX * 2, UCS2_PART_MAX * 2))
        }
    };
    let total = u8::try_from(parts.len())
        .map_err(|_| PduError::Unsupported("message needs more than 255 parts".to_string()))?;
    let concatenated = total > 1;

    let mut out = Vec::with_capacity(parts.len());
    for (idx, units) in parts.iter().enumerate() {
        let header = concatenated.then(|| [0x05, 0x00, 0x03, reference, total, idx as u8 + 1]);
        let mut tpdu = vec![if concatenated { 0x41 } else { 0x01 }, 0x00];
        tpdu.push(digits.len() as u8);
        tpdu.push(if international { 0x91 } else { 0x81 });
        tpdu.extend(semi_octets(digits.as_bytes()));
        tpdu.extend([0x00, dcs]);
        let header_bytes: &[u8] = header.as_ref().map(|h| &h[..]).unwrap_or(&[]);
        if dcs == 0x00 {
            let header_septets = (header_bytes.len() * 8).div_ceil(7);
            let fill = header_septets * 7 - header_bytes.len() * 8;
            tpdu.push((header_septets + units.len()) as u8);
            tpdu.extend_from_slice(header_bytes);
            tpdu.extend(pack_septets(units, fill));
        } else {
            tpdu.push((header_bytes.len() + units.len()) as u8);
            tpdu.extend_from_slice(header_bytes);
            tpdu.extend_from_slice(units);
        }
        out.push(SubmitPdu {
            tpdu_len: tpdu.len(),
            hex: format!("00{}", encode_hex(&tpdu)),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn decodes_plain_gsm7_deliver() {
        let pdu = decode_deliver(
            "07911326040000F0040B911346610089F60000208062917314080CC8F71D14969741F977FD07",
        )
        .unwrap();
        assert_eq!(pdu.sender, "+31641600986");
        assert_eq!(pdu.text, "How are you?");
        assert!(pdu.concat.is_none());
        let ts = pdu.timestamp.unwrap();
        assert_eq!((ts.year(), ts.month(), ts.day()), (2002, 8, 26));
        assert_eq!((ts.hour(), ts.minute(), ts.second()), (19, 37, 41));
        assert_eq!(ts.offset().local_minus_utc(), 2 * 3600);
    }

    #[test]
    fn decodes_concatenated_fragments() {
        let first =
            decode_deliver("00440B915155214365F70000427001318215400A050003070201906536").unwrap();
        let second =
            decode_deliver("00440B915155214365F700004270013182154009050003070202D86F").unwrap();
        assert_eq!(first.sender, "+15551234567");
        assert_eq!(first.text, "Hel");
        assert_eq!(
            first.concat,
            Some(ConcatHeader {
                reference: 7,
                total_parts: 2,
                part_number: 1
            })
        );
        assert_eq!(second.text, "lo");
        assert_eq!(second.concat.map(|c| c.part_number), Some(2));
        assert_eq!(first.timestamp.unwrap().offset().local_minus_utc(), 3600);
    }

    #[test]
    fn decodes_ucs2_text() {
        let pdu = decode_deliver("00040B915155214365F70008427001318215400C041F04400438043204350442")
            .unwrap();
        assert_eq!(pdu.text, "Привет");
    }

    #[test]
    fn rejects_truncated_and_non_hex_input() {
        assert_eq!(decode_deliver("0004"), Err(PduError::Truncated));
        assert_eq!(decode_deliver("zz"), Err(PduError::InvalidHex));
        assert_eq!(decode_deliver("123"), Err(PduError::InvalidHex));
    }

    #[test]
    fn decodes_alphanumeric_sender() {
        // "Info" packed as GSM7: 4 septets in 4 octets, 7 semi-octets
        let packed = encode_hex(&pack_septets(&[0x49, 0x6E, 0x66, 0x6F], 0));
        let hex = format!("000407D0{}0000427001318215400161", packed);
        let pdu = decode_deliver(&hex).unwrap();
        assert_eq!(pdu.sender, "Info");
        assert_eq!(pdu.text, "a");
    }

    #[test]
    fn extension_characters_round_through_escape() {
        let septets: Vec<u8> = "a€{".chars().flat_map(|c| gsm7_char(c).unwrap()).collect();
        assert_eq!(septets, vec![0x61, ESC, 0x65, ESC, 0x28]);
        assert_eq!(decode_gsm7(&septets), "a€{");
    }

    #[test]
    fn encodes_single_gsm7_submit() {
        let parts = encode_submit("+15551234567", "hello", 0).unwrap();
        assert_eq!(
            parts,
            vec![SubmitPdu {
                tpdu_len: 18,
                hex: "0001000B915155214365F7000005E8329BFD06".to_string()
            }]
        );
    }

    #[test]
    fn encodes_ucs2_when_text_leaves_gsm_alphabet() {
        let parts = encode_submit("+15551234567", "héllo ✓", 0).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].tpdu_len, 27);
        assert_eq!(
            parts[0].hex,
            "0001000B915155214365F700080E006800E9006C006C006F00202713"
        );
    }

    #[test]
    fn long_text_is_split_into_concatenated_parts() {
        let parts = encode_submit("+15551234567", &"a".repeat(161), 9).unwrap();
        assert_eq!(parts.len(), 2);
        for (i, part) in parts.iter().enumerate() {
            assert!(part.hex.starts_with("0041"));
            assert!(part.hex.contains(&format!("05000309020{}", i + 1)));
        }
        // 153 septets + 7 header septets
        assert!(parts[0].hex.contains("00A0050003"));

        assert_eq!(encode_submit("+1555", &"€".repeat(80), 0).unwrap().len(), 1);
        assert_eq!(encode_submit("+1555", &"✓".repeat(70), 0).unwrap().len(), 1);
        assert_eq!(encode_submit("+1555", &"✓".repeat(71), 0).unwrap().len(), 2);
    }

    #[test]
    fn rejects_non_numeric_destination() {
        assert!(encode_submit("someone", "hi", 0).is_err());
        assert!(encode_submit("+", "hi", 0).is_err());
    }
}
