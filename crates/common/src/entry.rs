use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// The unit of storage and transfer.
///
/// An `Entry` is one file or directory of the image: a canonical path,
/// POSIX-ish metadata, and (for files fetched individually) the raw
/// bytes. Directory listings ship entries with `value` stripped.
///
/// `hash_value` is assigned by the server on upload and doubles as the
/// blob's on-disk filename: SHA-1 of the content for files, SHA-1 of
/// the key for directories so that otherwise-equal directory records
/// stay distinguishable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,

    /// Raw file bytes; base64 on the wire, absent for directories and
    /// in listing replies.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub value: Vec<u8>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash_value: String,

    #[serde(default)]
    pub parent: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub is_dir: bool,

    #[serde(default)]
    pub size: i64,

    #[serde(default)]
    pub mode: u32,

    #[serde(default)]
    pub mod_time: i64,

    #[serde(default)]
    pub uid: u32,

    #[serde(default)]
    pub gid: u32,
}

impl Entry {
    /// The content address of this entry: SHA-1 of the bytes for files,
    /// SHA-1 of the key for directories. Must match on both sides of
    /// the sync protocol.
    pub fn content_hash(&self) -> String {
        if self.is_dir {
            content_hash(self.key.as_bytes())
        } else {
            content_hash(&self.value)
        }
    }

    /// Copy of this entry without its `value`, as served in directory
    /// listings.
    pub fn without_value(&self) -> Entry {
        Entry {
            value: Vec::new(),
            ..self.clone()
        }
    }
}

/// Hex-encoded SHA-1 of `data`.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// One line of the sync request: a key the client holds and the hash it
/// holds it under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEntry {
    pub key: String,
    pub hash: String,
}

/// Reply to a sync request: the keys the server lacks, or holds under a
/// different hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    pub need_upload: Vec<String>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_hash_is_sha1_of_value() {
        let entry = Entry {
            key: "/a/b".to_string(),
            value: b"hi".to_vec(),
            ..Default::default()
        };
        assert_eq!(
            entry.content_hash(),
            "c22b5f9178342609428d6f51b2c5af4c0bde6a42"
        );
    }

    #[test]
    fn dir_hash_is_sha1_of_key() {
        let entry = Entry {
            key: "/usr/lib".to_string(),
            is_dir: true,
            ..Default::default()
        };
        assert_eq!(entry.content_hash(), content_hash(b"/usr/lib"));
        // Two empty directories with different keys must not collide.
        let other = Entry {
            key: "/usr/share".to_string(),
            is_dir: true,
            ..Default::default()
        };
        assert_ne!(entry.content_hash(), other.content_hash());
    }

    #[test]
    fn value_round_trips_through_base64() {
        let entry = Entry {
            key: "/bin/true".to_string(),
            value: vec![0u8, 1, 2, 255, 254, 10, 13],
            name: "true".to_string(),
            size: 7,
            mode: 0o755,
            ..Default::default()
        };
        let encoded = serde_json::to_string(&entry).unwrap();
        assert!(encoded.contains("\"value\""));
        let decoded: Entry = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn listing_entry_omits_value() {
        let entry = Entry {
            key: "/a/b".to_string(),
            value: b"payload".to_vec(),
            hash_value: "abc".to_string(),
            ..Default::default()
        };
        let stripped = entry.without_value();
        let encoded = serde_json::to_string(&stripped).unwrap();
        assert!(!encoded.contains("\"value\""));
        let decoded: Entry = serde_json::from_str(&encoded).unwrap();
        assert!(decoded.value.is_empty());
        assert_eq!(decoded.hash_value, "abc");
    }
}
