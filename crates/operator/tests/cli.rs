use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn crd_gen_prints_the_site_crd() {
    Command::cargo_bin("crd-gen")
        .unwrap()
        .assert()
        .success()
        .stdout(predicate::str::contains("kind: CustomResourceDefinition"))
        .stdout(predicate::str::contains("name: sites.site-operator.dev"));
}

#[test]
fn operator_help_lists_overrides() {
    Command::cargo_bin("site-operator")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--serve-image"))
        .stdout(predicate::str::contains("--log-format"));
}
