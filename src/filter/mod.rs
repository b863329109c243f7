//! Message Filter: pure and deterministic. Given a message and a policy,
//! decide whether to forward it and as what.

use crate::domain::{FilterKind, FilterPolicy};
use crate::transport::{MessageKind, SourceMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Drop,
    ForwardAsText,
    ForwardAsMedia,
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];
const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "txt"];

/// Apply `policy` to `message`.
pub fn classify(message: &SourceMessage, policy: &FilterPolicy) -> Decision {
    match &message.kind {
        MessageKind::TextOnly { .. } => {
            if policy.contains(FilterKind::AllMedia) || policy.contains(FilterKind::TextOnly) {
                Decision::ForwardAsText
            } else {
                Decision::Drop
            }
        }
        MessageKind::Photo { .. } => {
            if policy.contains(FilterKind::TextOnly) {
                return Decision::Drop;
            }
            let wants_images = policy.contains(FilterKind::AllMedia)
                || policy.contains(FilterKind::Images)
                || IMAGE_EXTENSIONS.iter().any(|ext| policy.extensions.contains(*ext));
            if wants_images {
                Decision::ForwardAsMedia
            } else {
                Decision::Drop
            }
        }
        MessageKind::Document {
            mime_type,
            file_name,
            ..
        } => {
            if policy.contains(FilterKind::TextOnly) {
                return Decision::Drop;
            }
            if policy.contains(FilterKind::AllMedia) {
                return Decision::ForwardAsMedia;
            }

            let ext = file_extension(file_name.as_deref());

            let matches_class = (policy.contains(FilterKind::Videos) && mime_type.starts_with("video/"))
                || (policy.contains(FilterKind::Audio) && mime_type.starts_with("audio/"))
                || (policy.contains(FilterKind::Documents)
                    && (mime_type.starts_with("application/")
                        || ext.as_deref().is_some_and(|e| DOCUMENT_EXTENSIONS.contains(&e))));

            let matches_extension = ext
                .as_deref()
                .is_some_and(|e| policy.extensions.contains(e));

            if matches_class || matches_extension {
                Decision::ForwardAsMedia
            } else {
                Decision::Drop
            }
        }
        MessageKind::Empty => Decision::Drop,
    }
}

fn file_extension(file_name: Option<&str>) -> Option<String> {
    file_name.and_then(|name| name.rsplit('.').next()).map(|ext| ext.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::{document_message, photo_message, text_message};

    fn policy(kinds: &[FilterKind]) -> FilterPolicy {
        FilterPolicy {
            kinds: kinds.iter().copied().collect(),
            extensions: Default::default(),
        }
    }

    #[test]
    fn text_only_drops_media() {
        let p = policy(&[FilterKind::TextOnly]);
        assert_eq!(classify(&text_message(1, "hi"), &p), Decision::ForwardAsText);
        assert_eq!(classify(&photo_message(2), &p), Decision::Drop);
    }

    #[test]
    fn all_media_forwards_everything() {
        let p = policy(&[FilterKind::AllMedia]);
        assert_eq!(classify(&text_message(1, "hi"), &p), Decision::ForwardAsText);
        assert_eq!(classify(&photo_message(2), &p), Decision::ForwardAsMedia);
        assert_eq!(
            classify(&document_message(3, "application/pdf", Some("a.pdf")), &p),
            Decision::ForwardAsMedia
        );
    }

    #[test]
    fn images_class_matches_photo_and_extension_alias() {
        let p = policy(&[FilterKind::Images]);
        assert_eq!(classify(&photo_message(1), &p), Decision::ForwardAsMedia);

        let p_ext = FilterPolicy {
            kinds: Default::default(),
            extensions: ["jpg".to_string()].into_iter().collect(),
        };
        assert_eq!(classify(&photo_message(2), &p_ext), Decision::ForwardAsMedia);
    }

    #[test]
    fn video_class_checks_mime_prefix() {
        let p = policy(&[FilterKind::Videos]);
        assert_eq!(
            classify(&document_message(1, "video/mp4", Some("clip.mp4")), &p),
            Decision::ForwardAsMedia
        );
        assert_eq!(
            classify(&document_message(2, "audio/mpeg", Some("song.mp3")), &p),
            Decision::Drop
        );
    }

    #[test]
    fn custom_extension_matches_documents() {
        let p = FilterPolicy {
            kinds: Default::default(),
            extensions: ["epub".to_string()].into_iter().collect(),
        };
        assert_eq!(
            classify(&document_message(1, "application/epub+zip", Some("book.epub")), &p),
            Decision::ForwardAsMedia
        );
        assert_eq!(
            classify(&document_message(2, "application/octet-stream", Some("book.mobi")), &p),
            Decision::Drop
        );
    }

    #[test]
    fn filter_is_pure() {
        let p = policy(&[FilterKind::AllMedia]);
        let m = photo_message(1);
        assert_eq!(classify(&m, &p), classify(&m, &p));
    }
}
