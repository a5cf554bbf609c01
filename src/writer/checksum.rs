/// Compute the PE image checksum of `data`.
///
/// The image is summed as little-endian 16-bit words with end-around carry, skipping the
/// 4-byte `CheckSum` field at `checksum_offset`, and the file length is added to the folded sum.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn pe_checksum(data: &[u8], checksum_offset: usize) -> u32 {
    let field = checksum_offset..checksum_offset + 4;
    let mut sum: u64 = 0;

    for (index, chunk) in data.chunks(2).enumerate() {
        let offset = index * 2;
        if field.contains(&offset) {
            continue;
        }

        let word = u16::from_le_bytes([chunk[0], chunk.get(1).copied().unwrap_or(0)]);
        sum += u64::from(word);
        if sum > 0xFFFF {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
    }

    sum = (sum & 0xFFFF) + (sum >> 16);
    sum += data.len() as u64;
    sum as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_field() {
        #[rustfmt::skip]
        let data = [
            0x01, 0x00, 0x02, 0x00,
            0xFF, 0xFF, 0xFF, 0xFF,
            0x03, 0x00,
        ];
        assert_eq!(pe_checksum(&data, 4), 1 + 2 + 3 + data.len() as u32);
    }

    #[test]
    fn folds_carry() {
        let data = [0xFF, 0xFF, 0x02, 0x00, 0, 0, 0, 0];
        // 0xFFFF + 2 = 0x10001, folded to 0x0002
        assert_eq!(pe_checksum(&data, 4), 2 + 8);
    }

    #[test]
    fn odd_length() {
        let data = [0, 0, 0, 0, 0x05];
        assert_eq!(pe_checksum(&data, 0), 5 + 5);
    }
}
