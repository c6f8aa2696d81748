//! Make sure a host runs exactly the image version a run was planned with.

use log::{debug, error};

use crate::error::{DeployError, Result};
use crate::runtime::ContainerRuntime;
use crate::types::Implementation;

/// Split `repo[:tag]`, leaving registry ports alone.
fn split_reference(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

/// Is the image id present?  Tags it with the implementation's image name
/// when it is not tagged yet.
async fn check_image(
    runtime: &dyn ContainerRuntime,
    implementation: &Implementation,
) -> Result<bool> {
    let Some(image) = runtime.inspect_image(&implementation.image_id).await? else {
        debug!(
            "Image {} is (still) not available with id {} on {}",
            implementation.image,
            implementation.image_id,
            runtime.host()
        );
        return Ok(false);
    };
    let (repo, tag) = split_reference(&implementation.image);
    let wanted = format!("{}:{}", repo, tag);
    if !image.tags.iter().any(|t| *t == implementation.image || *t == wanted) {
        debug!(
            "Tagging image {} with {} on {}",
            image.id,
            implementation.image,
            runtime.host()
        );
        runtime.tag_image(&image.id, repo, tag).await?;
    }
    Ok(true)
}

async fn pull_and_verify(
    runtime: &dyn ContainerRuntime,
    implementation: &Implementation,
    reference: &str,
) -> Result<bool> {
    debug!("Trying to pull {} on {}", reference, runtime.host());
    match runtime.pull_image(reference).await {
        Ok(()) => check_image(runtime, implementation).await,
        Err(e) if e.is_not_found() => {
            debug!("Could not pull {} on {}", reference, runtime.host());
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Ensure `implementation.image_id` is available on the host, pulling the
/// repo digests first and the version tags second.
pub async fn ensure_image(
    runtime: &dyn ContainerRuntime,
    implementation: &Implementation,
) -> Result<()> {
    if check_image(runtime, implementation).await? {
        return Ok(());
    }
    let candidates = implementation.image_repo_digests.iter().cloned().chain(
        implementation
            .image_versions
            .iter()
            .map(|version| format!("{}:{}", implementation.image, version)),
    );
    for candidate in candidates {
        if pull_and_verify(runtime, implementation, &candidate).await? {
            return Ok(());
        }
    }
    error!(
        "Image {} not available with id {} on {} and could also not be pulled.",
        implementation.image,
        implementation.image_id,
        runtime.host()
    );
    Err(DeployError::ImageUnavailable {
        image: implementation.image.clone(),
        image_id: implementation.image_id.clone(),
        host: runtime.host().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::{Event, FakeRuntime};
    use crate::runtime::ImageInfo;

    fn implementation() -> Implementation {
        Implementation {
            name: "quic-go".into(),
            image: "martenseemann/quic-go-interop".into(),
            image_id: "sha256:aaa".into(),
            image_repo_digests: vec!["martenseemann/quic-go-interop@sha256:bbb".into()],
            image_versions: vec!["v0.40".into()],
        }
    }

    #[test]
    fn references_split_at_the_tag() {
        assert_eq!(split_reference("a/b:v1"), ("a/b", "v1"));
        assert_eq!(split_reference("a/b"), ("a/b", "latest"));
        assert_eq!(split_reference("localhost:5000/b"), ("localhost:5000/b", "latest"));
    }

    #[tokio::test]
    async fn present_image_gets_tagged() {
        let runtime = FakeRuntime::new();
        runtime.add_image(
            "sha256:aaa",
            ImageInfo {
                id: "sha256:aaa".into(),
                tags: vec![],
            },
        );
        ensure_image(&*runtime, &implementation()).await.unwrap();
        assert!(runtime.events().contains(&Event::Tagged {
            image: "sha256:aaa".into(),
            repo: "martenseemann/quic-go-interop".into(),
            tag: "latest".into(),
        }));
        assert!(!runtime.events().iter().any(|e| matches!(e, Event::Pulled(_))));
    }

    #[tokio::test]
    async fn candidates_are_tried_in_order() {
        let runtime = FakeRuntime::new();
        // The digest is gone from the registry, the version tag still works.
        runtime.add_pullable(
            "martenseemann/quic-go-interop:v0.40",
            ImageInfo {
                id: "sha256:aaa".into(),
                tags: vec!["martenseemann/quic-go-interop:v0.40".into()],
            },
        );
        ensure_image(&*runtime, &implementation()).await.unwrap();
        let pulls: Vec<_> = runtime
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Pulled(reference) => Some(reference),
                _ => None,
            })
            .collect();
        assert_eq!(
            pulls,
            vec![
                "martenseemann/quic-go-interop@sha256:bbb".to_string(),
                "martenseemann/quic-go-interop:v0.40".to_string(),
            ]
        );
        assert!(runtime
            .image("sha256:aaa")
            .unwrap()
            .tags
            .contains(&"martenseemann/quic-go-interop:latest".to_string()));
    }

    #[tokio::test]
    async fn wrong_id_after_pull_is_fatal() {
        let runtime = FakeRuntime::new();
        runtime.add_pullable(
            "martenseemann/quic-go-interop@sha256:bbb",
            ImageInfo {
                id: "sha256:other".into(),
                tags: vec![],
            },
        );
        let err = ensure_image(&*runtime, &implementation())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::ImageUnavailable { .. }));
    }
}
