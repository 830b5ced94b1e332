//! Trie test vectors.
//!
//! Each vector is a sequence of key-value writes and an expected root hash.
//! Inputs given as an object are order-independent; inputs given as a list
//! replay in order. Keys and values starting with `0x` are hex, anything
//! else is ASCII, and a falsy value (null, empty, or hex decoding to no
//! bytes) removes the key (the vector convention for deletes).
//!
//! Every vector also replays through a secured trie, checked against the
//! root a plain trie produces for the keccak-hashed keys.

use ethers::utils::keccak256;
use mpt::{store::MemoryStorage, utils::hex_decode, MerklePatriciaTrie};
use serde_json::Value;

const VECTORS: &str = r#"
{
    "emptyValues": {
        "in": [
            ["do", "verb"],
            ["ether", "wookiedoo"],
            ["horse", "stallion"],
            ["shaman", "horse"],
            ["doge", "coin"],
            ["ether", null],
            ["dog", "puppy"],
            ["shaman", "0x"]
        ],
        "root": "0x5991bb8c6514148a29db676a14ac506cd2cd5775ace63c30a4fe457715e9ac84"
    },
    "anyOrder": {
        "in": {
            "horse": "stallion",
            "doge": "coin",
            "do": "verb",
            "dog": "puppy"
        },
        "root": "0x5991bb8c6514148a29db676a14ac506cd2cd5775ace63c30a4fe457715e9ac84"
    },
    "anyOrderHexKeys": {
        "in": {
            "0x686f727365": "stallion",
            "0x646f6765": "coin",
            "0x646f": "verb",
            "0x646f67": "puppy"
        },
        "root": "0x5991bb8c6514148a29db676a14ac506cd2cd5775ace63c30a4fe457715e9ac84"
    },
    "dogs": {
        "in": {
            "doe": "reindeer",
            "dog": "puppy",
            "dogglesworth": "cat"
        },
        "root": "0x8aad789dff2f538bca5d8ea56e8abe10f4c7ba3a5dea95fea4cd6e7c3a1168d3"
    },
    "foo": {
        "in": {
            "foo": "bar",
            "food": "bass"
        },
        "root": "0x17beaa1648bafa633cda809c90c04af50fc8aed3cb40d16efbddee6fdf63c4c3"
    }
}
"#;

/// Decodes a vector string: `0x`-prefixed hex or plain ASCII. Falsy
/// entries mean "no value"; truthiness is judged on the decoded bytes, so
/// null, "" and "0x" all delete.
fn normalize(value: &Value) -> Option<Vec<u8>> {
    let bytes = match value {
        Value::Null => Vec::new(),
        Value::String(string) => match string.strip_prefix("0x") {
            Some(stripped) => hex::decode(stripped).unwrap(),
            None => string.as_bytes().to_vec(),
        },
        other => panic!("unexpected vector entry {other}"),
    };
    if bytes.is_empty() {
        None
    } else {
        Some(bytes)
    }
}

fn collect_ops(input: &Value) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
    match input {
        Value::Array(pairs) => pairs
            .iter()
            .map(|pair| {
                let pair = pair.as_array().expect("vector pair");
                (normalize(&pair[0]).expect("key"), normalize(&pair[1]))
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| (normalize(&Value::String(key.clone())).expect("key"), normalize(value)))
            .collect(),
        other => panic!("unexpected vector input {other}"),
    }
}

#[test]
fn test_vectors() {
    let vectors: Value = serde_json::from_str(VECTORS).unwrap();
    for (name, vector) in vectors.as_object().unwrap() {
        let mut storage = MemoryStorage::new();
        let mut trie = MerklePatriciaTrie::new(&mut storage);

        for (key, value) in collect_ops(&vector["in"]) {
            match value {
                Some(value) => trie.update(&key, &value).unwrap(),
                None => trie.delete(&key).unwrap(),
            }
        }

        let expected = hex_decode(vector["root"].as_str().unwrap()).unwrap();
        assert_eq!(
            trie.root_hash().as_bytes(),
            expected.as_slice(),
            "vector {name} produced the wrong root"
        );
    }
}

/// A secure trie is a plain trie behind a key-hashing boundary: replaying a
/// vector through it must land on the root of a plain trie fed the
/// keccak-hashed keys.
#[test]
fn test_vectors_secure() {
    let vectors: Value = serde_json::from_str(VECTORS).unwrap();
    for (name, vector) in vectors.as_object().unwrap() {
        let ops = collect_ops(&vector["in"]);

        let mut secure_storage = MemoryStorage::new();
        let mut secure = MerklePatriciaTrie::new(&mut secure_storage).secured();
        for (key, value) in &ops {
            match value {
                Some(value) => secure.update(key, value).unwrap(),
                None => secure.delete(key).unwrap(),
            }
        }

        let mut hashed_storage = MemoryStorage::new();
        let mut hashed_keys = MerklePatriciaTrie::new(&mut hashed_storage);
        for (key, value) in &ops {
            let hashed = keccak256(key);
            match value {
                Some(value) => hashed_keys.update(&hashed, value).unwrap(),
                None => hashed_keys.delete(&hashed).unwrap(),
            }
        }

        assert_eq!(
            secure.root_hash(),
            hashed_keys.root_hash(),
            "secure vector {name} diverged from its hashed-key equivalent"
        );
    }
}
