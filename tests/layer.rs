mod common;

use common::TempDir;
use podder::Layer;

#[test]
fn create_and_reopen_round_trips_config() {
    let tmp = TempDir::new().unwrap();

    let base = Layer::open(tmp.as_path(), "base", None).unwrap();
    let mut base = base;
    base.set_cmd(&["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()]);
    base.set_env(vec![("A".to_string(), "1".to_string())]);
    base.write().unwrap();

    assert!(tmp.join("base/root").is_dir());
    assert!(tmp.join("base/merged").is_dir());
    assert!(tmp.join("base/config.ini").is_file());
    assert!(!tmp.join("base/parent").exists());

    let reopened = Layer::open(tmp.as_path(), "base", None).unwrap();
    assert_eq!(
        reopened.cmd(),
        vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()]
    );
    assert_eq!(reopened.env(), vec![("A".to_string(), "1".to_string())]);
}

#[test]
fn child_layer_chains_to_parent_via_symlink() {
    let tmp = TempDir::new().unwrap();

    let parent = Layer::open(tmp.as_path(), "parent", None).unwrap();
    let mut parent = parent;
    parent.set_env(vec![("BASE".to_string(), "yes".to_string())]);
    parent.write().unwrap();

    let parent_reopened = Layer::open(tmp.as_path(), "parent", None).unwrap();
    let mut child = Layer::open(tmp.as_path(), "child", Some(parent_reopened)).unwrap();
    child.set_env(vec![("CHILD".to_string(), "yes".to_string())]);
    child.write().unwrap();

    assert!(tmp.join("child/parent").symlink_metadata().unwrap().file_type().is_symlink());

    // Reopened with no explicit parent, the on-disk symlink is followed.
    let reopened = Layer::open(tmp.as_path(), "child", None).unwrap();
    let mut env = reopened.env();
    env.sort();
    assert_eq!(
        env,
        vec![
            ("BASE".to_string(), "yes".to_string()),
            ("CHILD".to_string(), "yes".to_string())
        ]
    );
    assert_eq!(reopened.overlay(), vec![tmp.join("child/root"), tmp.join("parent/root")]);
}

#[test]
fn ephemeral_flag_round_trips() {
    let tmp = TempDir::new().unwrap();
    let mut layer = Layer::open(tmp.as_path(), "throwaway", None).unwrap();
    assert!(!layer.ephemeral());
    layer.set_ephemeral(true);
    layer.write().unwrap();

    let reopened = Layer::open(tmp.as_path(), "throwaway", None).unwrap();
    assert!(reopened.ephemeral());
}

#[test]
fn write_is_idempotent_and_never_touches_root_contents() {
    let tmp = TempDir::new().unwrap();
    let layer = Layer::open(tmp.as_path(), "idem", None).unwrap();
    layer.write().unwrap();

    let marker = tmp.join("idem/root/marker");
    std::fs::write(&marker, b"keep me").unwrap();

    layer.write().unwrap();
    layer.write().unwrap();

    assert_eq!(std::fs::read(&marker).unwrap(), b"keep me");
}
