use hex::FromHexError;

pub fn to_hex_str(data: &[u8]) -> String {
    format!("0x{}", hex::encode(data))
}

pub fn try_bytes_from_hex_str(input: &str) -> Result<Vec<u8>, FromHexError> {
    let input = input.strip_prefix("0x").unwrap_or(input);
    hex::decode(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let data = [0u8, 1, 0xab, 0xff];
        let encoded = to_hex_str(&data);
        assert_eq!(encoded, "0x0001abff");
        assert_eq!(try_bytes_from_hex_str(&encoded).unwrap(), data);
        // the prefix is optional on input
        assert_eq!(try_bytes_from_hex_str("0001abff").unwrap(), data);
    }
}
