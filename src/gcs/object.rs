//! GCS bucket and object models, as the JSON API reports them.

use serde::Deserialize;

/// A bucket selected for listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub name: String,
    /// Lexicographic resume point: listing starts at names `>=` this.
    pub start_offset: String,
    pub should_include: bool,
}

impl Bucket {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), start_offset: String::new(), should_include: true }
    }
}

/// One listed object with the attributes chunk metadata needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub name: String,
    pub bucket: String,
    pub content_type: String,
    /// Owning entity's email, when the ACL exposes one.
    pub owner: String,
    pub link: String,
    /// Base64 of the MD5 digest, straight from the listing. Doubles as the
    /// dedup fingerprint.
    pub md5: String,
    pub acl: Vec<String>,
    pub size: i64,
    /// Unix seconds.
    pub created_at: i64,
    pub updated_at: i64,
}

// --- Wire models ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListBucketsResponse {
    #[serde(default)]
    pub items: Vec<BucketAttrs>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BucketAttrs {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListObjectsResponse {
    #[serde(default)]
    pub items: Vec<ObjectAttrs>,
    pub next_page_token: Option<String>,
}

/// The attribute selection requested from the listing endpoint. The API
/// reports `size` as a decimal string and times as RFC 3339.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ObjectAttrs {
    pub name: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub md5_hash: String,
    #[serde(default)]
    pub size: String,
    pub time_created: Option<String>,
    pub updated: Option<String>,
    pub owner: Option<OwnerAttrs>,
    #[serde(default)]
    pub acl: Vec<AclAttrs>,
    pub media_link: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OwnerAttrs {
    pub entity: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AclAttrs {
    pub entity: String,
}

impl ObjectAttrs {
    pub fn parsed_size(&self) -> i64 {
        self.size.parse().unwrap_or(0)
    }

    /// Build the model object for a bucket's listing entry.
    pub fn into_object(self, bucket: &str, endpoint: &str) -> Object {
        let size = self.parsed_size();
        let link = self.media_link.clone().unwrap_or_else(|| {
            format!("{endpoint}/storage/v1/b/{bucket}/o/{}?alt=media", self.name)
        });
        Object {
            bucket: bucket.to_string(),
            content_type: self.content_type,
            owner: self
                .owner
                .map(|o| o.entity.trim_start_matches("user-").to_string())
                .unwrap_or_default(),
            link,
            md5: self.md5_hash,
            acl: self.acl.into_iter().map(|a| a.entity).collect(),
            size,
            created_at: parse_unix_seconds(self.time_created.as_deref()),
            updated_at: parse_unix_seconds(self.updated.as_deref()),
            name: self.name,
        }
    }
}

fn parse_unix_seconds(value: Option<&str>) -> i64 {
    value
        .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.timestamp())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"{
        "items": [{
            "name": "backups/db.sql",
            "contentType": "application/sql",
            "md5Hash": "CY9rzUYh03PK3k6DJie09g==",
            "size": "2048",
            "timeCreated": "2024-05-01T10:00:00Z",
            "updated": "2024-05-02T10:00:00Z",
            "owner": {"entity": "user-ops@example.com"},
            "acl": [{"entity": "user-ops@example.com"}, {"entity": "allUsers"}],
            "mediaLink": "https://storage.googleapis.com/download/storage/v1/b/bkt/o/backups%2Fdb.sql?alt=media"
        }],
        "nextPageToken": "tok123"
    }"#;

    #[test]
    fn listing_deserializes() {
        let listed: ListObjectsResponse = serde_json::from_str(LISTING).unwrap();
        assert_eq!(listed.items.len(), 1);
        assert_eq!(listed.next_page_token.as_deref(), Some("tok123"));
        assert_eq!(listed.items[0].parsed_size(), 2048);
    }

    #[test]
    fn attrs_convert_to_object() {
        let listed: ListObjectsResponse = serde_json::from_str(LISTING).unwrap();
        let object = listed
            .items
            .into_iter()
            .next()
            .unwrap()
            .into_object("bkt", "https://storage.googleapis.com");
        assert_eq!(object.name, "backups/db.sql");
        assert_eq!(object.bucket, "bkt");
        assert_eq!(object.owner, "ops@example.com");
        assert_eq!(object.md5, "CY9rzUYh03PK3k6DJie09g==");
        assert_eq!(object.acl, vec!["user-ops@example.com", "allUsers"]);
        assert_eq!(object.created_at, 1714557600);
        assert!(object.link.contains("alt=media"));
    }

    #[test]
    fn missing_times_default_to_zero() {
        let attrs: ObjectAttrs =
            serde_json::from_str(r#"{"name":"x","size":"notanumber"}"#).unwrap();
        let object = attrs.into_object("bkt", "https://storage.googleapis.com");
        assert_eq!(object.created_at, 0);
        assert_eq!(object.size, 0);
    }
}
