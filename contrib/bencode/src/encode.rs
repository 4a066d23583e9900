use std::collections::BTreeMap;

/// An owned bencode value for building documents.
///
/// Encoding is always canonical: a `BTreeMap` keeps dictionary keys in
/// lexicographic byte order and integers are emitted in canonical
/// decimal, so encoding the same logical document twice yields identical
/// bytes. That determinism is what makes generated info hashes stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Bytes(Vec<u8>),
    Int(i64),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    /// A byte-string value from anything byte-like.
    #[must_use]
    pub fn bytes(bytes: impl AsRef<[u8]>) -> BencodeValue {
        BencodeValue::Bytes(bytes.as_ref().to_vec())
    }

    #[must_use]
    pub fn new_dict() -> BencodeValue {
        BencodeValue::Dict(BTreeMap::new())
    }

    #[must_use]
    pub fn new_list() -> BencodeValue {
        BencodeValue::List(Vec::new())
    }

    /// Inserts an entry when the value is a dictionary.
    ///
    /// # Panics
    ///
    /// Will panic if the value is not a dictionary. Builders construct
    /// their dictionaries locally, so a mismatch is a programming error.
    pub fn insert(&mut self, key: impl AsRef<[u8]>, value: BencodeValue) {
        match self {
            BencodeValue::Dict(entries) => {
                entries.insert(key.as_ref().to_vec(), value);
            }
            _ => panic!("insert called on a non-dictionary bencode value"),
        }
    }

    /// Appends an element when the value is a list.
    ///
    /// # Panics
    ///
    /// Will panic if the value is not a list.
    pub fn push(&mut self, value: BencodeValue) {
        match self {
            BencodeValue::List(elements) => elements.push(value),
            _ => panic!("push called on a non-list bencode value"),
        }
    }

    /// Encodes the value into canonical bencode bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        encode_value(self, &mut bytes);
        bytes
    }
}

fn encode_value(val: &BencodeValue, bytes: &mut Vec<u8>) {
    match val {
        BencodeValue::Int(n) => encode_int(*n, bytes),
        BencodeValue::Bytes(n) => encode_bytes(n, bytes),
        BencodeValue::List(n) => encode_list(n, bytes),
        BencodeValue::Dict(n) => encode_dict(n, bytes),
    }
}

fn encode_int(val: i64, bytes: &mut Vec<u8>) {
    bytes.push(crate::INT_START);

    bytes.extend(val.to_string().into_bytes());

    bytes.push(crate::BEN_END);
}

fn encode_bytes(list: &[u8], bytes: &mut Vec<u8>) {
    bytes.extend(list.len().to_string().into_bytes());

    bytes.push(crate::BYTE_LEN_END);

    bytes.extend(list.iter().copied());
}

fn encode_list(list: &[BencodeValue], bytes: &mut Vec<u8>) {
    bytes.push(crate::LIST_START);

    for i in list {
        encode_value(i, bytes);
    }

    bytes.push(crate::BEN_END);
}

fn encode_dict(dict: &BTreeMap<Vec<u8>, BencodeValue>, bytes: &mut Vec<u8>) {
    // The map iterates in sorted key order, which is the canonical form.
    bytes.push(crate::DICT_START);
    for (key, value) in dict {
        encode_bytes(key, bytes);
        encode_value(value, bytes);
    }
    bytes.push(crate::BEN_END);
}

#[cfg(test)]
mod tests {
    use super::BencodeValue;
    use crate::value::Value;

    #[test]
    fn it_should_encode_integers_canonically() {
        assert_eq!(BencodeValue::Int(500).encode(), b"i500e");
        assert_eq!(BencodeValue::Int(-500).encode(), b"i-500e");
        assert_eq!(BencodeValue::Int(0).encode(), b"i0e");
    }

    #[test]
    fn it_should_encode_byte_strings_with_a_length_prefix() {
        assert_eq!(BencodeValue::bytes(b"spam").encode(), b"4:spam");
        assert_eq!(BencodeValue::bytes(b"").encode(), b"0:");
    }

    #[test]
    fn it_should_encode_dictionary_keys_in_sorted_order() {
        let mut dict = BencodeValue::new_dict();
        dict.insert(b"zebra", BencodeValue::Int(1));
        dict.insert(b"apple", BencodeValue::Int(2));
        dict.insert(b"mango", BencodeValue::Int(3));

        assert_eq!(dict.encode(), b"d5:applei2e5:mangoi3e5:zebrai1ee");
    }

    #[test]
    fn it_should_encode_nested_structures() {
        let mut inner = BencodeValue::new_list();
        inner.push(BencodeValue::Int(-500_500));

        let mut nested = BencodeValue::new_dict();
        nested.insert(b"list", inner);

        let mut dict = BencodeValue::new_dict();
        dict.insert(b"nested dict", nested);
        dict.insert(b"number", BencodeValue::Int(500_500));

        assert_eq!(dict.encode(), b"d11:nested dictd4:listli-500500eee6:numberi500500ee");
    }

    #[test]
    fn it_should_produce_output_the_decoder_accepts() {
        let mut dict = BencodeValue::new_dict();
        dict.insert(b"lucky_number", BencodeValue::Int(7));
        dict.insert(b"lucky_string", BencodeValue::bytes(b"7"));

        let encoded = dict.encode();
        let decoded = Value::decode(&encoded).unwrap();

        let entries = decoded.dict().unwrap();
        assert_eq!(Value::lookup(entries, b"lucky_number").unwrap().int(), Some(7));
        assert_eq!(
            Value::lookup(entries, b"lucky_string").unwrap().bytes(),
            Some(b"7".as_slice())
        );
    }
}
