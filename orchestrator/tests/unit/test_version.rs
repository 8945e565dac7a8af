//! Version specifier and image ordering tests

use std::cmp::Ordering;

use ephemera::image::resolver::ImageResolver;
use ephemera::image::{identify, ImageDef, ImageSource, ResolvedImage, Variant};
use ephemera::storage::settings::ImageSettings;

const SPECS: [&str; 10] = [
    "7.2.0",
    "7.2",
    "community-7.2.0",
    "7.2.0-14",
    "community-7.2.0-14",
    "enterprise-7.6.0-1234",
    "jdoe-enterprise-7.6.0-1234",
    "7.6.0-1234-serverless",
    "7.10.1",
    "enterprise-7.6.0",
];

#[test]
fn test_identify_recovers_encoded_fields() {
    let def = identify("community-7.2.0-14-serverless").unwrap();
    assert_eq!(def.version, "7.2.0");
    assert_eq!(def.build_number, 14);
    assert!(def.is_community());
    assert!(def.serverless);

    let def = identify("7.2.0-14").unwrap();
    assert_eq!(def.version, "7.2.0");
    assert_eq!(def.build_number, 14);
    assert!(!def.is_community());
}

#[test]
fn test_identify_rejects() {
    for spec in ["7", "invalid", "gold-7.2.0", "7.2.0-x", ""] {
        let err = identify(spec).unwrap_err();
        assert!(err.is_terminal(), "{} should fail terminally", spec);
    }
}

#[test]
fn test_display_round_trip() {
    for spec in SPECS {
        let def = identify(spec).unwrap();
        let again = identify(&def.to_string()).unwrap();
        assert_eq!(def, again, "{} -> {}", spec, def);
        assert_eq!(def.owner, again.owner);
        assert_eq!(def.serverless, again.serverless);
    }
}

#[test]
fn test_image_order_is_antisymmetric_and_transitive() {
    let defs: Vec<ImageDef> = SPECS.iter().map(|s| identify(s).unwrap()).collect();

    for a in &defs {
        for b in &defs {
            assert_eq!(a.cmp(b), b.cmp(a).reverse(), "{} vs {}", a, b);
            for c in &defs {
                if a <= b && b <= c {
                    assert!(a <= c, "{} <= {} <= {}", a, b, c);
                }
            }
        }
    }
}

#[test]
fn test_image_order_fields() {
    let order = |a: &str, b: &str| identify(a).unwrap().cmp(&identify(b).unwrap());

    assert_eq!(order("7.2.0", "7.10.0"), Ordering::Less);
    assert_eq!(order("7.6.0-1", "7.6.0-2"), Ordering::Less);
    assert_eq!(order("community-7.6.0", "enterprise-7.6.0"), Ordering::Less);
    assert_eq!(order("7.6.0-5", "7.6.0-5-serverless"), Ordering::Less);
    assert_eq!(order("7.2", "enterprise-7.2.0-0"), Ordering::Equal);
}

#[test]
fn test_resolved_images_ignore_artifact_path() {
    let def = identify("7.6.0").unwrap();
    let pulled = ResolvedImage::from_def(
        &def,
        "registry-a/server:7.6.0".to_string(),
        ImageSource::Registry { authenticated: false },
    );
    let built = ResolvedImage::from_def(
        &def,
        "registry-b/server:7.6.0".to_string(),
        ImageSource::Derived {
            base: "registry-a/server:7.6.0".to_string(),
        },
    );
    assert_eq!(pulled.cmp(&built), Ordering::Equal);
}

#[test]
fn test_resolver_provider_chain() {
    let settings = ImageSettings {
        build_registry_token: Some("token".to_string().into()),
        ..ImageSettings::default()
    };
    let resolver = ImageResolver::from_settings(&settings);

    let released = resolver.resolve_spec("community-7.2.0").unwrap();
    assert_eq!(released.artifact_path, "couchbase/server:community-7.2.0");

    let build = resolver.resolve_spec("jdoe-enterprise-7.6.0-1234").unwrap();
    assert_eq!(build.artifact_path, "ghcr.io/cb-vanilla/server:jdoe-7.6.0-1234");

    let serverless = resolver.resolve_spec("7.6.0-serverless").unwrap();
    assert_eq!(serverless.variant, Variant::Serverless);
    match serverless.source {
        ImageSource::Derived { base } => assert_eq!(base, "couchbase/server:enterprise-7.6.0"),
        other => panic!("unexpected source {:?}", other),
    }
}

#[test]
fn test_resolver_rejects_community_serverless() {
    let resolver = ImageResolver::from_settings(&ImageSettings::default());
    let err = resolver.resolve_spec("community-7.6.0-serverless").unwrap_err();
    assert!(err.is_terminal());
}
