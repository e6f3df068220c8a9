use peerauth::identity::mapfile::substitute;
use peerauth::identity::{IdentityMapper, MapFile, PeerIdentity, RealmMap, RealmMapper};
use proptest::prelude::*;
use std::fs;

const RULES: &str = r#"# method    principal                              canonical
KERBEROS    /^([^\/@]+)(\/[^@]+)?@EXAMPLE\.ORG$/   \1@example.org
SSL         "/CN=Alice Smith/O=Example"            alice@example.org
SCITOKENS   "https://issuer.example.org/,bob"      bob
SCITOKENS   /^https:\/\/other\.org,(.*)$/i         \1@other.org
"#;

#[test]
fn mapping_is_stable_across_lookups() {
    let mapper = IdentityMapper::with_rules(MapFile::parse_str(RULES, true, None));
    let first = mapper.map("KERBEROS", "carol/admin@EXAMPLE.ORG");
    let second = mapper.map("KERBEROS", "carol/admin@EXAMPLE.ORG");
    assert_eq!(first.as_deref(), Some("carol@example.org"));
    assert_eq!(first, second);
    assert_eq!(
        mapper.map("SSL", "/CN=Alice Smith/O=Example").as_deref(),
        Some("alice@example.org")
    );
    assert_eq!(mapper.map("SSL", "/CN=Mallory"), None);
    assert_eq!(mapper.map("GSI", "/CN=Alice Smith/O=Example"), None);
}

#[test]
fn canonicalize_fills_domain_and_retries_extra_slash() {
    let mapper = IdentityMapper::with_rules(MapFile::parse_str(RULES, true, None));

    let mut peer = PeerIdentity::default();
    peer.set_authenticated_name("https://issuer.example.org,bob");
    let identity = peer.snapshot("SCITOKENS", None);

    assert!(mapper.canonicalize(&identity, "local", false).is_none());
    let mapped = mapper
        .canonicalize(&identity, "local", true)
        .expect("mapped with trailing slash");
    assert_eq!(mapped.user, "bob");
    assert_eq!(mapped.domain, "local");

    let mut other = PeerIdentity::default();
    other.set_authenticated_name("HTTPS://OTHER.ORG,dave");
    let mapped = mapper
        .canonicalize(&other.snapshot("SCITOKENS", None), "local", false)
        .expect("caseless rule");
    assert_eq!((mapped.user.as_str(), mapped.domain.as_str()), ("dave", "other.org"));
}

#[test]
fn file_is_loaded_lazily_and_reread_after_reconfig() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("mapfile");
    fs::write(&path, "CLAIMTOBE alice first@example.org\n").expect("write");

    let mapper = IdentityMapper::new(Some(path.clone()), true);
    assert!(mapper.is_configured());
    assert!(!mapper.load_attempted());
    assert_eq!(mapper.map("CLAIMTOBE", "alice").as_deref(), Some("first@example.org"));
    assert!(mapper.load_attempted());

    fs::write(&path, "CLAIMTOBE alice second@example.org\n").expect("rewrite");
    assert_eq!(
        mapper.map("CLAIMTOBE", "alice").as_deref(),
        Some("first@example.org"),
        "rules stay cached until reconfig"
    );
    mapper.reconfig();
    assert!(!mapper.load_attempted());
    assert_eq!(mapper.map("CLAIMTOBE", "alice").as_deref(), Some("second@example.org"));
}

#[test]
fn missing_file_maps_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mapper = IdentityMapper::new(Some(dir.path().join("absent")), true);
    assert_eq!(mapper.map("KERBEROS", "alice@EXAMPLE.ORG"), None);
    assert!(mapper.load_attempted());

    let path = dir.path().join("present");
    fs::write(&path, "KERBEROS alice@EXAMPLE.ORG alice@example.org\n").expect("write");
    mapper.reconfig_with(Some(path));
    assert_eq!(
        mapper.map("KERBEROS", "alice@EXAMPLE.ORG").as_deref(),
        Some("alice@example.org")
    );
}

#[test]
fn include_directory_is_read_in_name_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let parts = dir.path().join("mapfile.d");
    fs::create_dir(&parts).expect("mkdir");
    fs::write(parts.join("20-late"), "SSL \"/CN=bob\" late@example.org\n").expect("write");
    fs::write(parts.join("10-early"), "SSL \"/CN=bob\" early@example.org\n").expect("write");
    let top = dir.path().join("mapfile");
    fs::write(&top, "@include mapfile.d\nSSL \"/CN=carol\" carol@example.org\n").expect("write");

    let rules = MapFile::load(&top, true).expect("load");
    assert_eq!(rules.map("SSL", "/CN=bob").as_deref(), Some("early@example.org"));
    assert_eq!(rules.map("SSL", "/CN=carol").as_deref(), Some("carol@example.org"));
}

#[test]
fn realm_map_turns_realms_into_domains() {
    let map = RealmMap::parse_str("EXAMPLE.ORG = example.org\n# comment\nCORP.NET = corp.net\n");
    assert_eq!(map.len(), 2);
    let realms = RealmMapper::with_map(map);
    assert_eq!(realms.domain_for("CORP.NET").expect("listed"), "corp.net");
    assert!(realms.domain_for("ELSEWHERE").is_err());

    let unconfigured = RealmMapper::new(None);
    assert_eq!(unconfigured.domain_for("ELSEWHERE").expect("identity"), "ELSEWHERE");
}

proptest! {
    #[test]
    fn templates_without_backslashes_are_literal(template in "[^\\\\]{0,40}", group in ".{0,10}") {
        prop_assert_eq!(substitute(&template, &[group.as_str()]), template);
    }

    #[test]
    fn group_references_expand(prefix in "[a-z@.]{0,8}", user in "[a-z0-9_]{1,12}") {
        let template = format!("{prefix}\\1@example.org");
        prop_assert_eq!(
            substitute(&template, &["whole", user.as_str()]),
            format!("{prefix}{user}@example.org")
        );
    }

    #[test]
    fn missing_groups_stay_verbatim(user in "[a-z]{1,8}") {
        prop_assert_eq!(substitute("\\7", &[user.as_str()]), "\\7");
    }
}
