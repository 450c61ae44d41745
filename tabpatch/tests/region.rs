// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::BTreeMap, ops::Range};

use assert_matches::assert_matches;
use tabpatch::{
    config::Config,
    patch::region::{
        self, ConvertOutcome, CountryCode, Discriminator, RegionLayout, RegionPatcher,
    },
};

fn patcher() -> RegionPatcher {
    Config::builtin().unwrap().region_patcher()
}

fn code(s: &str) -> CountryCode {
    s.parse().unwrap()
}

/// A devinfo dump with legacy country records at fixed offsets.
fn devinfo(code: &[u8; 2]) -> Vec<u8> {
    let mut data = vec![0u8; 4096];

    for offset in [0x100, 0x480, 0x900] {
        let record = [b"\0\0\0".as_slice(), code, b"XX\0\0\0"].concat();
        data[offset..offset + record.len()].copy_from_slice(&record);
    }

    data
}

#[test]
fn parse_country_code() {
    assert_eq!(code("kr").as_str(), "KR");
    assert_eq!(code(" CN ").to_string(), "CN");
    assert_matches!("K".parse::<CountryCode>(), Err(region::Error::InvalidCode(_)));
    assert_matches!("K1".parse::<CountryCode>(), Err(region::Error::InvalidCode(_)));
    assert_matches!("KOR".parse::<CountryCode>(), Err(region::Error::InvalidCode(_)));

    assert_eq!(patcher().country_name(code("KR")), Some("Korea"));
    assert_eq!(patcher().country_name(code("QQ")), None);
}

#[test]
fn detect_region() {
    let detection = patcher().detect(&devinfo(b"CN")).unwrap();

    assert_eq!(detection.layout, "country-marker-legacy");
    assert_eq!(detection.code, code("CN"));
    assert_eq!(
        detection.matches.iter().map(|m| m.offset).collect::<Vec<_>>(),
        [0x103, 0x483, 0x903],
    );
}

#[test]
fn patch_cn_to_kr() {
    let original = devinfo(b"CN");
    let patch = patcher().patch_region(original.clone(), code("KR")).unwrap();

    assert!(patch.changed);
    assert_eq!(patch.previous, code("CN"));
    assert_eq!(patch.target, code("KR"));
    assert_eq!(patch.count, 3);
    assert_eq!(patch.data, devinfo(b"KR"));

    // Only the code bytes differ.
    let differing = original
        .iter()
        .zip(&patch.data)
        .filter(|(a, b)| a != b)
        .count();
    assert_eq!(differing, 6);

    // Patching again is a no-op.
    let again = patcher().patch_region(patch.data.clone(), code("KR")).unwrap();
    assert!(!again.changed);
    assert_eq!(again.previous, code("KR"));
    assert_eq!(again.data, patch.data);
}

#[test]
fn compact_layout() {
    let mut data = vec![0xffu8; 512];
    data[40..46].copy_from_slice(b"\0USXX\0");

    let patch = patcher().patch_region(data, code("DE")).unwrap();
    assert_eq!(patch.layout, "country-marker");
    assert_eq!(&patch.data[40..46], b"\0DEXX\0");
}

/// Two firmware branches that store the same records in different windows.
fn branch_patcher() -> RegionPatcher {
    fn layout(name: &str, magic: &[u8], window: Range<u64>, expected_count: usize) -> RegionLayout {
        RegionLayout {
            name: name.to_owned(),
            discriminator: Some(Discriminator {
                offset: 8,
                magic: magic.to_vec(),
            }),
            prefix: b"\0".to_vec(),
            suffix: b"XX\0".to_vec(),
            window: Some(window),
            expected_count: Some(expected_count),
        }
    }

    RegionPatcher::new(
        vec![
            layout("branch-a", b"DPA1", 0x100..0x200, 2),
            layout("branch-b", b"DPB1", 0x200..0x300, 1),
        ],
        BTreeMap::from([
            (code("CN"), "China".to_owned()),
            (code("KR"), "Korea".to_owned()),
        ]),
    )
}

fn branch_data(magic: &[u8], records: &[usize]) -> Vec<u8> {
    let mut data = vec![0xffu8; 1024];
    data[8..8 + magic.len()].copy_from_slice(magic);
    for &offset in records {
        data[offset..offset + 6].copy_from_slice(b"\0CNXX\0");
    }
    data
}

#[test]
fn layout_by_discriminator() {
    let patcher = branch_patcher();
    let records = [0x110, 0x150, 0x210];

    let a = branch_data(b"DPA1", &records);
    assert!(patcher.layouts()[0].applies_to(&a));
    assert!(!patcher.layouts()[1].applies_to(&a));

    let patch = patcher.patch_region(a, code("KR")).unwrap();
    assert_eq!(patch.layout, "branch-a");
    assert_eq!(patch.count, 2);
    assert_eq!(&patch.data[0x110..0x116], b"\0KRXX\0");
    assert_eq!(&patch.data[0x150..0x156], b"\0KRXX\0");
    // Outside the selected layout's window.
    assert_eq!(&patch.data[0x210..0x216], b"\0CNXX\0");

    let patch = patcher
        .patch_region(branch_data(b"DPB1", &records), code("KR"))
        .unwrap();
    assert_eq!(patch.layout, "branch-b");
    assert_eq!(patch.count, 1);
    assert_eq!(&patch.data[0x110..0x116], b"\0CNXX\0");
    assert_eq!(&patch.data[0x210..0x216], b"\0KRXX\0");

    assert_matches!(
        patcher.patch_region(branch_data(b"DPC1", &records), code("KR")),
        Err(region::Error::NoLayout)
    );

    // A discriminator past the end never matches.
    assert!(!patcher.layouts()[0].applies_to(&[0u8; 8]));
}

#[test]
fn layout_record_count() {
    assert_matches!(
        branch_patcher().detect(&branch_data(b"DPA1", &[0x110, 0x210])),
        Err(region::Error::PatternNotFound {
            expected: Some(2),
            found: 1,
            ..
        })
    );
}

#[test]
fn missing_or_conflicting_records() {
    assert_matches!(
        patcher().detect(&[0u8; 4096]),
        Err(region::Error::PatternNotFound { found: 0, .. })
    );

    // Unknown codes are not records.
    assert_matches!(
        patcher().detect(&devinfo(b"QQ")),
        Err(region::Error::PatternNotFound { .. })
    );

    let mut data = devinfo(b"CN");
    data[0x483..0x485].copy_from_slice(b"KR");
    assert_matches!(
        patcher().patch_region(data, code("US")),
        Err(region::Error::AmbiguousPattern(codes)) if codes == [code("CN"), code("KR")]
    );
}

#[test]
fn convert_rom_patterns() {
    let data = b"ro.product.region=.ROW\0feature=IROW\0other=.ROW\0".to_vec();

    let (converted, outcome) = patcher().convert_rom(data).unwrap();
    assert_eq!(outcome, ConvertOutcome::Converted { count: 3 });
    assert_eq!(
        converted,
        b"ro.product.region=.PRC\0feature=IPRC\0other=.PRC\0".to_vec(),
    );

    let (unchanged, outcome) = patcher().convert_rom(converted.clone()).unwrap();
    assert_eq!(outcome, ConvertOutcome::AlreadyConverted);
    assert_eq!(unchanged, converted);

    assert_matches!(
        patcher().convert_rom(b"nothing to see".to_vec()),
        Err(region::Error::SwapPatternNotFound)
    );
}
