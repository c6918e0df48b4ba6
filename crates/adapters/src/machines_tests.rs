// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn parses_full_line_with_all_fields() {
    let machines = parse(
        "builder1 x86_64-linux,aarch64-linux /home/build/.ssh/id_builder 4 2.0 kvm,big-parallel kvm -",
    )
    .unwrap();
    assert_eq!(machines.len(), 1);
    let m = &machines[0];
    assert_eq!(m.name.as_str(), "builder1");
    assert!(m.system_types.contains("x86_64-linux"));
    assert_eq!(m.max_jobs, 4);
    assert_eq!(m.speed_factor, 2.0);
    assert!(m.mandatory_features.contains("kvm"));
    // Mandatory features are automatically added to supported features.
    assert!(m.supported_features.contains("kvm"));
    assert!(m.supported_features.contains("big-parallel"));
}

#[test]
fn dashes_mean_absent_with_documented_defaults() {
    let machines = parse("builder1 x86_64-linux - - -").unwrap();
    let m = &machines[0];
    assert_eq!(m.max_jobs, 1);
    assert_eq!(m.speed_factor, 1.0);
    assert!(m.ssh_key.is_none());
}

#[test]
fn comments_and_blank_lines_are_ignored() {
    let machines = parse(
        "\n# a comment\nbuilder1 x86_64-linux - - -\n# another\n\nbuilder2 aarch64-linux - - -\n",
    )
    .unwrap();
    assert_eq!(machines.len(), 2);
}

#[test]
fn lines_with_fewer_than_three_tokens_are_ignored() {
    let machines = parse("builder1 x86_64-linux\nbuilder2 aarch64-linux -").unwrap();
    assert_eq!(machines.len(), 1);
    assert_eq!(machines[0].name.as_str(), "builder2");
}

#[test]
fn localhost_line_parses_like_any_other_machine() {
    let machines = parse("localhost x86_64-linux - 2 1").unwrap();
    assert_eq!(machines[0].name.as_str(), "localhost");
}
