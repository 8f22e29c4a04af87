// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use crate::Fingerprint;

#[test]
fn of_bytes_matches_known_sha256() {
    // SHA-256 of the empty input.
    assert_eq!(
        Fingerprint::of_bytes(b"").to_hex(),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
}

#[test]
fn from_hex_string() {
    assert_eq!(
        Fingerprint::from_hex_string(
            "0123456789abcdefFEDCBA98765432100000000000000000ffFFfFfFFfFfFFff",
        )
        .unwrap(),
        Fingerprint([
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0xfe, 0xdc, 0xba, 0x98, 0x76, 0x54,
            0x32, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff,
        ],)
    )
}

#[test]
fn from_hex_string_not_long_enough() {
    Fingerprint::from_hex_string("abcd").expect_err("Want err");
}

#[test]
fn from_hex_string_too_long() {
    Fingerprint::from_hex_string(
        "0123456789ABCDEF0123456789ABCDEF0123456789ABCDEF0123456789ABCDEF0",
    )
    .expect_err("Want err");
}

#[test]
fn from_hex_string_invalid_chars() {
    Fingerprint::from_hex_string(
        "Q123456789ABCDEF0123456789ABCDEF0123456789ABCDEF0123456789ABCDEF",
    )
    .expect_err("Want err");
}

#[test]
fn hex_round_trip() {
    let hex = "0123456789abcdeffedcba98765432100000000000000000ffffffffffffffff";
    assert_eq!(Fingerprint::from_hex_string(hex).unwrap().to_hex(), hex);
}

#[test]
fn from_str_round_trips() {
    let hex = "ab23456789abcdeffedcba98765432100000000000000000ffffffffffffffff";
    let fingerprint: Fingerprint = hex.parse().unwrap();
    assert_eq!(fingerprint.as_bytes()[0], 0xab);
    assert_eq!(Fingerprint::try_from(hex).unwrap(), fingerprint);
}

#[test]
fn prefix_is_first_byte() {
    let fingerprint = Fingerprint::from_hex_string(
        "ab23456789abcdeffedcba98765432100000000000000000ffffffffffffffff",
    )
    .unwrap();
    assert_eq!(fingerprint.prefix(), "ab");
}

#[test]
fn serializes_as_hex_string() {
    let fingerprint = Fingerprint::of_bytes(b"candidate");
    let json = serde_json::to_string(&fingerprint).unwrap();
    assert_eq!(json, format!("\"{}\"", fingerprint.to_hex()));
    let back: Fingerprint = serde_json::from_str(&json).unwrap();
    assert_eq!(back, fingerprint);
}
