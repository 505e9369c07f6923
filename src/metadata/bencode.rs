use std::collections::BTreeMap;

use thiserror::Error;

/// Deepest list/dictionary nesting the parser accepts.
pub const MAX_NESTING_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(i64),
    ByteString(Vec<u8>),
    List(Vec<BencodeValue>),
    Dictionary(BTreeMap<Vec<u8>, BencodeValue>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("{num_remaining} bytes left over after the top-level value")]
    UnconsumedContents { num_remaining: usize },
    #[error("input ended in the middle of a value")]
    InsufficientContents,
    #[error("unknown value type {value:#04x} at byte {pos}")]
    UnknownType { pos: usize, value: u8 },
    #[error("integer at byte {pos} has leading zeros")]
    IntegerWithLeadingZeros { pos: usize },
    #[error("empty integer at byte {pos}")]
    EmptyInteger { pos: usize },
    #[error("illegal integer at byte {pos}")]
    IllegalInteger { pos: usize },
    #[error("value at byte {pos} is not terminated")]
    UnterminatedValue { pos: usize },
    #[error("byte string at {pos} is missing its ':' separator")]
    StringMissingSeparator { pos: usize },
    #[error("dictionary key `{name}` appears twice")]
    DuplicateDictionaryKey { name: String },
    #[error("dictionary keys are not sorted")]
    DictionaryKeysOutOfOrder,
    #[error("value at byte {pos} is nested deeper than {MAX_NESTING_DEPTH} levels")]
    NestingTooDeep { pos: usize },
}

type Result<T> = std::result::Result<T, BencodeError>;

impl TryFrom<&[u8]> for BencodeValue {
    type Error = BencodeError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        BencodeParser::new(bytes).deserialize()
    }
}

/// Canonical encoding, dictionary keys in sorted order.
impl From<&BencodeValue> for Vec<u8> {
    fn from(value: &BencodeValue) -> Vec<u8> {
        let mut v = Vec::new();
        value.encode_into(&mut v);
        v
    }
}

impl BencodeValue {
    fn encode_into(&self, v: &mut Vec<u8>) {
        match self {
            BencodeValue::Integer(i) => v.extend(format!("i{}e", i).as_bytes()),
            BencodeValue::ByteString(bytes) => {
                v.extend(format!("{}:", bytes.len()).as_bytes());
                v.extend_from_slice(bytes);
            },
            BencodeValue::List(elements) => {
                v.push(b'l');
                for element in elements {
                    element.encode_into(v);
                }
                v.push(b'e');
            },
            BencodeValue::Dictionary(items) => {
                v.push(b'd');
                for (key, value) in items {
                    v.extend(format!("{}:", key.len()).as_bytes());
                    v.extend_from_slice(key);
                    value.encode_into(v);
                }
                v.push(b'e');
            },
        }
    }

    pub fn bytes(bytes: &[u8]) -> Self {
        BencodeValue::ByteString(bytes.to_vec())
    }
}

struct BencodeParser<'a> {
    contents: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> BencodeParser<'a> {
    fn new(contents: &'a [u8]) -> Self {
        Self { contents, pos: 0, depth: 0 }
    }

    fn deserialize(&mut self) -> Result<BencodeValue> {
        let value = self.parse_value()?;
        if self.pos != self.contents.len() {
            Err(BencodeError::UnconsumedContents { num_remaining: self.contents.len() - self.pos })
        } else {
            Ok(value)
        }
    }

    fn peek(&self) -> Result<u8> {
        self.contents.get(self.pos).copied().ok_or(BencodeError::InsufficientContents)
    }

    fn parse_value(&mut self) -> Result<BencodeValue> {
        match self.peek()? {
            b'i' => self.parse_integer(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dictionary(),
            b'0'..=b'9' => self.parse_string().map(BencodeValue::ByteString),
            value => Err(BencodeError::UnknownType { pos: self.pos, value }),
        }
    }

    fn parse_digits(&mut self, leading_zeros_allowed: bool) -> Result<u64> {
        let start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        let slice = &self.contents[start..self.pos];
        if slice.is_empty() {
            return Err(BencodeError::EmptyInteger { pos: start });
        }
        if !leading_zeros_allowed && slice[0] == b'0' && slice.len() > 1 {
            return Err(BencodeError::IntegerWithLeadingZeros { pos: start });
        }
        std::str::from_utf8(slice)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or(BencodeError::IllegalInteger { pos: start })
    }

    fn parse_integer(&mut self) -> Result<BencodeValue> {
        self.pos += 1;
        let negative = self.peek()? == b'-';
        if negative {
            self.pos += 1;
        }
        let start = self.pos;
        let magnitude = self.parse_digits(false)?;
        if negative && magnitude == 0 {
            return Err(BencodeError::IllegalInteger { pos: start });
        }
        let value = i64::try_from(magnitude).map_err(|_| BencodeError::IllegalInteger { pos: start })?;
        self.expect_end()?;
        Ok(BencodeValue::Integer(if negative { -value } else { value }))
    }

    fn parse_string(&mut self) -> Result<Vec<u8>> {
        let length = self.parse_digits(true)? as usize;
        if self.peek()? != b':' {
            return Err(BencodeError::StringMissingSeparator { pos: self.pos });
        }
        self.pos += 1;
        let end = self.pos.checked_add(length).ok_or(BencodeError::InsufficientContents)?;
        if end > self.contents.len() {
            return Err(BencodeError::InsufficientContents);
        }
        let v = self.contents[self.pos..end].to_vec();
        self.pos = end;
        Ok(v)
    }

    fn descend(&mut self) -> Result<()> {
        if self.depth == MAX_NESTING_DEPTH {
            return Err(BencodeError::NestingTooDeep { pos: self.pos });
        }
        self.depth += 1;
        self.pos += 1;
        Ok(())
    }

    fn ascend(&mut self) {
        self.depth -= 1;
        self.pos += 1;
    }

    fn parse_list(&mut self) -> Result<BencodeValue> {
        self.descend()?;
        let mut values = Vec::new();
        while self.peek()? != b'e' {
            values.push(self.parse_value()?);
        }
        self.ascend();
        Ok(BencodeValue::List(values))
    }

    fn parse_dictionary(&mut self) -> Result<BencodeValue> {
        self.descend()?;
        let mut map: BTreeMap<Vec<u8>, BencodeValue> = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = self.parse_string()?;
            if let Some((last, _)) = map.last_key_value() {
                if key < *last {
                    return Err(BencodeError::DictionaryKeysOutOfOrder);
                } else if key == *last {
                    return Err(BencodeError::DuplicateDictionaryKey {
                        name: String::from_utf8_lossy(&key).into_owned(),
                    });
                }
            }
            let value = self.parse_value()?;
            map.insert(key, value);
        }
        self.ascend();
        Ok(BencodeValue::Dictionary(map))
    }

    fn expect_end(&mut self) -> Result<()> {
        if self.peek()? != b'e' {
            Err(BencodeError::UnterminatedValue { pos: self.pos })
        } else {
            self.pos += 1;
            Ok(())
        }
    }
}
