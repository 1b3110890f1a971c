use serde::{Deserialize, Serialize};

/// Continuation token handed back by a paginated source.
pub type Cursor = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingEnvelope<T> {
    #[serde(default)]
    pub kind: String,
    pub data: Listing<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing<T> {
    #[serde(default)]
    pub after: Option<Cursor>,
    #[serde(default)]
    pub before: Option<Cursor>,
    #[serde(default = "Vec::new")]
    pub children: Vec<Thing<T>>,
}

impl<T> Default for Listing<T> {
    fn default() -> Self {
        Self {
            after: None,
            before: None,
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thing<T> {
    #[serde(default)]
    pub kind: String,
    pub data: T,
}

/// One media post or library file.
///
/// Reddit saved items and filesystem entries share this shape. Saved comments
/// deserialize too (with an empty title) so a mixed listing never fails as a
/// whole; the paginator drops them before they reach the source list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Post {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subreddit: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub permalink: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub created_utc: f64,
    #[serde(default)]
    pub thumbnail: String,
    #[serde(default)]
    pub post_hint: String,
    #[serde(default)]
    pub is_video: bool,
    #[serde(default)]
    pub over_18: bool,
    #[serde(default)]
    pub media: Option<PostMedia>,
    #[serde(default)]
    pub secure_media: Option<PostMedia>,
    #[serde(default)]
    pub preview: Preview,
}

impl Post {
    /// Provenance label: subreddit for Reddit posts, folder for library files.
    pub fn group(&self) -> &str {
        self.subreddit.trim_start_matches("r/")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostMedia {
    #[serde(default)]
    pub reddit_video: Option<RedditVideo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RedditVideo {
    #[serde(default)]
    pub fallback_url: String,
    #[serde(default)]
    pub hls_url: String,
    #[serde(default)]
    pub dash_url: String,
    #[serde(default)]
    pub is_gif: bool,
    #[serde(default)]
    pub width: i64,
    #[serde(default)]
    pub height: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preview {
    #[serde(default)]
    pub images: Vec<PreviewImage>,
    #[serde(default)]
    pub reddit_video_preview: Option<RedditVideo>,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreviewImage {
    #[serde(default)]
    pub source: PreviewSource,
    #[serde(default)]
    pub resolutions: Vec<PreviewSource>,
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreviewSource {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub width: i64,
    #[serde(default)]
    pub height: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saved_listing_with_comment_decodes() {
        let payload = r#"{
            "kind": "Listing",
            "data": {
                "after": "t3_next",
                "children": [
                    {"kind": "t3", "data": {"id": "a1", "title": "Cat", "subreddit": "cats",
                        "url": "https://i.redd.it/cat.jpg", "created_utc": 1700000000.0}},
                    {"kind": "t1", "data": {"id": "c1", "body": "nice", "author": "bob"}}
                ]
            }
        }"#;
        let envelope: ListingEnvelope<Post> = serde_json::from_str(payload).unwrap();
        assert_eq!(envelope.data.after.as_deref(), Some("t3_next"));
        assert_eq!(envelope.data.children.len(), 2);
        assert_eq!(envelope.data.children[0].data.group(), "cats");
        assert!(envelope.data.children[1].data.title.is_empty());
    }
}
