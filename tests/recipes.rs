use fwpatch::{Assembler, EncodeError, Error, Feature, Ledger, Model, Patcher, Thumb};
use pretty_assertions::assert_eq;

/// Zero-filled image of `len` bytes with `chunks` placed at their offsets.
fn image(len: usize, chunks: &[(usize, &[u8])]) -> Vec<u8> {
    let mut image = vec![0u8; len];
    for (offset, bytes) in chunks {
        image[*offset..*offset + bytes.len()].copy_from_slice(bytes);
    }
    image
}

fn feature(text: &str) -> Feature {
    text.parse().unwrap()
}

fn thumb(source: &str) -> Vec<u8> {
    Thumb.assemble(source).unwrap()
}

fn names(records: &[fwpatch::PatchRecord]) -> Vec<&str> {
    records.iter().map(|r| r.name.as_str()).collect()
}

const MOTOR_NTC: &[u8] = &[0xf6, 0xf7, 0x12, 0xf9, 0xf6, 0xf7, 0x34, 0xfa];

#[test]
fn disable_motor_ntc_nops_both_calls() {
    let mut img = image(0x40, &[(0x10, MOTOR_NTC)]);
    let records = Patcher::new(&mut img, Model::G2, &Thumb)
        .apply_feature(&feature("disable_motor_ntc"))
        .unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].offset, 0x10);
    assert_eq!(records[0].pre, MOTOR_NTC);
    assert_eq!(hex::encode(&img[0x10..0x18]), "aff30080aff30080");
    assert_eq!(img.len(), 0x40);
}

#[test]
fn skip_key_check_branches_past_the_check() {
    let mut img = image(
        0x80,
        &[
            (0x20, &[0x40, 0x1c, 0x10, 0x28, 0x07, 0xdb, 0x00, 0x20]),
            (0x41, &[0xdb, 0x0c, 0xb9, 0x33, 0xf8, 0x05]),
        ],
    );
    let original = img.clone();

    let records = Patcher::new(&mut img, Model::Zt3Pro, &Thumb)
        .apply_feature(&Feature::SkipKeyCheck)
        .unwrap();
    assert_eq!(records[0].offset, 0x26);
    assert_eq!(records[0].pre, vec![0x00, 0x20]);
    // b to 0x42, one past the odd signature start
    assert_eq!(records[0].post, vec![0x0c, 0xe0]);

    let again = Patcher::new(&mut img, Model::Zt3Pro, &Thumb).apply_feature(&Feature::SkipKeyCheck);
    assert!(matches!(
        again,
        Err(Error::AlreadyPatched { offset: 0x26, .. })
    ));

    fwpatch::revert(&mut img, &records[0]).unwrap();
    assert_eq!(img, original);
}

#[test]
fn skip_key_check_without_target_is_not_found() {
    let mut img = image(0x40, &[(0x20, &[0x40, 0x1c, 0x10, 0x28, 0x07, 0xdb, 0x00, 0x20])]);
    let res = Patcher::new(&mut img, Model::G2, &Thumb).apply_feature(&Feature::SkipKeyCheck);
    assert!(matches!(res, Err(Error::SignatureNotFound { .. })));
    assert_eq!(&img[0x26..0x28], [0x00, 0x20]);
}

#[test]
fn zt3pro_region_free() {
    let mut img = image(
        0x40,
        &[
            (0x10, &[0xc0, 0x78, 0x45, 0x28]),
            (0x30, &[0x03, 0x20, 0xc8, 0x70, 0x4a, 0x70]),
        ],
    );
    let records = Patcher::new(&mut img, Model::Zt3Pro, &Thumb)
        .apply_feature(&Feature::RegionFree)
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "region_free");
    assert_eq!(records[0].pre, vec![0xc0, 0x78]);
    assert_eq!(records[0].post, vec![0x0e, 0xe0]);
}

#[test]
fn g3_region_free_is_unsupported() {
    let mut img = image(0x40, &[]);
    let res = Patcher::new(&mut img, Model::G3, &Thumb).apply_feature(&Feature::RegionFree);
    assert!(matches!(
        res,
        Err(Error::Unsupported { model: Model::G3, .. })
    ));
}

#[test]
fn g2_us_region_spoof_follows_switch_table() {
    let region_check: [u8; 22] = [
        0x18, 0x78, 0xff, 0x21, 0x03, 0x24, 0x30, 0x28, 0x05, 0xd1, 0x5a, 0x78, 0x31, 0x2a, 0x05,
        0xd1, 0x9a, 0x78, 0x47, 0x2a, 0x05, 0xd0,
    ];
    let switch: [u8; 12] = [
        0xd8, 0x78, 0x54, 0x38, 0x07, 0x28, 0x05, 0xd2, 0xdf, 0xe8, 0x00, 0xf0,
    ];
    // tbb entries for 'T'..='Z'
    let table: [u8; 7] = [0x04, 0x05, 0x06, 0x07, 0x10, 0x08, 0x09];
    let mut img = image(0x80, &[(0x10, &region_check), (0x40, &switch), (0x4c, &table)]);

    let records = Patcher::new(&mut img, Model::G2, &Thumb)
        .apply_feature(&Feature::UsRegionSpoof)
        .unwrap();
    // beq from 0x24 to the 'X' case at 0x4c + 2 * 0x10
    assert_eq!(records[0].offset, 0x24);
    assert_eq!(records[0].pre, vec![0x05, 0xd0]);
    assert_eq!(records[0].post, vec![0x22, 0xd0]);
}

#[test]
fn us_region_spoof_is_a_no_op_on_other_models() {
    let mut img = image(0x20, &[]);
    let records = Patcher::new(&mut img, Model::F2, &Thumb)
        .apply_feature(&Feature::UsRegionSpoof)
        .unwrap();
    assert!(records.is_empty());
    assert_eq!(img, vec![0u8; 0x20]);
}

fn with_enc_data(len: usize) -> Vec<u8> {
    image(len, &[(0x400, b"NineBotScooter")])
}

#[test]
fn embed_enc_key_replaces_first_copy() {
    let mut img = with_enc_data(0x500);
    let records = Patcher::new(&mut img, Model::Zt3Pro, &Thumb)
        .apply_feature(&feature("embed_enc_key=00112233445566778899AABBCCDDEEFF"))
        .unwrap();
    assert_eq!(records[0].offset, 0x420);
    assert_eq!(
        hex::encode(&img[0x420..0x430]),
        "00112233445566778899aabbccddeeff"
    );
}

#[test]
fn embed_rand_code_writes_six_characters() {
    let mut img = with_enc_data(0x500);
    Patcher::new(&mut img, Model::G3, &Thumb)
        .apply_feature(&feature("embed_rand_code=AB12CD"))
        .unwrap();
    assert_eq!(&img[0x430..0x436], b"AB12CD");
}

#[test]
fn embedding_needs_encryption_data() {
    let mut img = image(0x500, &[(0x400, b"SomethingElse")]);
    let res = Patcher::new(&mut img, Model::G2, &Thumb)
        .apply_feature(&feature("embed_enc_key=00112233445566778899aabbccddeeff"));
    assert!(matches!(res, Err(Error::MissingEncryptionData)));
}

#[test]
fn short_enc_key_is_rejected() {
    let mut img = with_enc_data(0x500);
    let res = Patcher::new(&mut img, Model::G2, &Thumb).apply_feature(&feature("embed_enc_key=0011"));
    assert!(matches!(res, Err(Error::InvalidArgument { .. })));
}

const G2_MAX_SPORT: &[u8] = &[
    0x80, 0xc7, 0xfe, 0xff, 0x70, 0x11, 0x01, 0x00, 0x18, 0x02, 0xff, 0xff,
];

#[test]
fn g2_ampere_max_sport_is_stored_negated() {
    let mut img = image(0x40, &[(0x10, G2_MAX_SPORT)]);
    Patcher::new(&mut img, Model::G2, &Thumb)
        .apply_feature(&Feature::AmpereMaxSport(90000))
        .unwrap();
    assert_eq!(&img[0x10..0x14], (-90000i32).to_le_bytes());
    assert_eq!(&img[0x10..0x14], [0x70, 0xa0, 0xfe, 0xff]);
}

#[test]
fn unchanged_value_is_already_patched() {
    // 80000 A is what the table holds already
    let mut img = image(0x40, &[(0x10, G2_MAX_SPORT)]);
    let original = img.clone();
    let res = Patcher::new(&mut img, Model::G2, &Thumb).apply_feature(&Feature::AmpereMaxSport(80000));
    assert!(matches!(res, Err(Error::AlreadyPatched { offset: 0x10, .. })));
    assert_eq!(img, original);
}

#[test]
fn g2_remove_autobrake_makes_branch_unconditional() {
    let sig: [u8; 12] = [
        0x58, 0x49, 0x08, 0x68, 0x43, 0xf6, 0x58, 0x62, 0x90, 0x42, 0x1a, 0xdd,
    ];
    let mut img = image(0x40, &[(0x10, &sig)]);
    Patcher::new(&mut img, Model::G2, &Thumb)
        .apply_feature(&Feature::RemoveAutobrake)
        .unwrap();
    assert_eq!(&img[0x1a..0x1c], [0x1a, 0xe0]);
}

#[test]
fn volt_limit_truncates_to_centivolts() {
    let sig: [u8; 14] = [
        0x91, 0x42, 0x04, 0xd3, 0x11, 0x68, 0x41, 0xf2, 0x04, 0x11, 0x88, 0x42, 0x06, 0xd9,
    ];
    let mut img = image(0x40, &[(0x10, &sig)]);
    let records = Patcher::new(&mut img, Model::G2, &Thumb)
        .apply_feature(&feature("volt_limit=43.219"))
        .unwrap();
    assert_eq!(records[0].post, thumb("movw r1, #4321"));
}

#[test]
fn volt_limit_loads_centivolts() {
    let sig: [u8; 14] = [
        0x91, 0x42, 0x04, 0xd3, 0x11, 0x68, 0x41, 0xf2, 0x04, 0x11, 0x88, 0x42, 0x06, 0xd9,
    ];
    let mut img = image(0x40, &[(0x10, &sig)]);
    let records = Patcher::new(&mut img, Model::Max4, &Thumb)
        .apply_feature(&feature("volt_limit=43"))
        .unwrap();
    assert_eq!(records[0].offset, 0x16);
    // movw r1, #4300
    assert_eq!(hex::encode(&records[0].post), "41f2cc01");
}

#[test]
fn unsupported_combinations() {
    let mut img = image(0x40, &[]);
    let mut patcher = Patcher::new(&mut img, Model::Zt3Pro, &Thumb);
    assert!(matches!(
        patcher.apply_feature(&Feature::RemoveKers),
        Err(Error::Unsupported { model: Model::Zt3Pro, .. })
    ));

    let mut img = image(0x40, &[]);
    let mut patcher = Patcher::new(&mut img, Model::G2, &Thumb);
    let err = patcher.apply_feature(&Feature::BmsBaudrate(115200)).unwrap_err();
    assert_eq!(err.to_string(), "bms_baudrate is not supported on g2");
}

#[test]
fn closure_assembler_supplies_the_bytes() {
    let fill = |_: &str| -> Result<Vec<u8>, EncodeError> { Ok(vec![0xaa; 8]) };
    let mut img = image(0x40, &[(0x10, MOTOR_NTC)]);
    let records = Patcher::new(&mut img, Model::G2, &fill)
        .apply_feature(&Feature::DisableMotorNtc)
        .unwrap();
    assert_eq!(records[0].post, vec![0xaa; 8]);
}

#[test]
fn wrong_width_from_assembler_is_fatal() {
    let short = |_: &str| -> Result<Vec<u8>, EncodeError> { Ok(vec![0x00, 0xbf]) };
    let mut img = image(0x40, &[(0x10, MOTOR_NTC)]);
    let original = img.clone();
    let res = Patcher::new(&mut img, Model::G2, &short).apply_feature(&Feature::DisableMotorNtc);
    assert!(matches!(
        res,
        Err(Error::LengthMismatch {
            expected: 8,
            actual: 2,
            ..
        })
    ));
    assert_eq!(img, original);
}

#[test]
fn assembler_failure_is_wrapped() {
    let broken = |source: &str| -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::UnknownMnemonic {
            mnemonic: source.to_owned(),
        })
    };
    let mut img = image(0x40, &[(0x10, MOTOR_NTC)]);
    let res = Patcher::new(&mut img, Model::G2, &broken).apply_feature(&Feature::DisableMotorNtc);
    match res {
        Err(Error::Encoding { source }) => {
            assert_eq!(
                source,
                EncodeError::UnknownMnemonic {
                    mnemonic: "nop.w\nnop.w".into()
                }
            )
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn ledger_of_several_features_reverts_cleanly() {
    let mut img = image(
        0x80,
        &[
            (0x10, MOTOR_NTC),
            (0x30, &[0xc0, 0x78, 0x45, 0x28]),
            (0x50, &[0x03, 0x20, 0xc8, 0x70, 0x4a, 0x70]),
        ],
    );
    let original = img.clone();

    let ledger: Ledger = Patcher::new(&mut img, Model::Zt3Pro, &Thumb)
        .apply_all(&[Feature::DisableMotorNtc, Feature::RegionFree])
        .unwrap();
    assert_eq!(ledger.len(), 2);
    assert_ne!(img, original);

    let json = ledger.to_json().unwrap();
    let restored = Ledger::from_json(&json).unwrap();
    assert_eq!(restored, ledger);

    restored.revert(&mut img).unwrap();
    assert_eq!(img, original);
}

const MODE_TABLE: &[u8] = &[
    0x19, 0x48, 0x90, 0xf8, 0x4f, 0x00, 0x17, 0x4f, 0x1c, 0x4a, 0x1c, 0x4b,
];

/// Mode table at 0x10 and two eco/sport limit pairs, sport stock at 22 km/h.
fn speed_image() -> Vec<u8> {
    image(
        0xa0,
        &[
            (0x10, MODE_TABLE),
            (0x60, &[0x0f, 0x20, 0xb8, 0x70, 0x87, 0xf8, 0x03, 0xb0, 0x16, 0x21]),
            (0x80, &[0x0f, 0x20, 0xb8, 0x70, 0x87, 0xf8, 0x03, 0xb0, 0x16, 0x22]),
        ],
    )
}

#[test]
fn default_speed_params_skip_stock_values() {
    let mut img = speed_image();
    let records = Patcher::new(&mut img, Model::Zt3Pro, &Thumb)
        .apply_feature(&feature("speed_params"))
        .unwrap();

    // eco is 15 in both the firmware and the defaults
    assert_eq!(
        names(&records),
        vec![
            "speed_params_ped",
            "speed_params_drive_0",
            "speed_params_drive_1",
            "speed_params_sport_0",
            "speed_params_sport_1",
        ]
    );
    assert_eq!(&img[0x1c..0x1e], thumb("movs r1, #10").as_slice());
    assert_eq!(&img[0x20..0x24], thumb("mov.w r11, #20").as_slice());
    assert_eq!(&img[0x2c..0x30], thumb("mov.w r8, #20").as_slice());
    assert_eq!(&img[0x60..0x62], [0x0f, 0x20]);
    // each sport load keeps its own destination register
    assert_eq!(&img[0x68..0x6a], thumb("movs r1, #25").as_slice());
    assert_eq!(&img[0x88..0x8a], thumb("movs r2, #25").as_slice());
}

#[test]
fn speed_params_patches_every_mode_pair() {
    let mut img = speed_image();
    let records = Patcher::new(&mut img, Model::Zt3Pro, &Thumb)
        .apply_feature(&feature("speed_params=30:22:12:8"))
        .unwrap();
    assert_eq!(records.len(), 7);
    assert_eq!(&img[0x60..0x62], thumb("movs r0, #12").as_slice());
    assert_eq!(&img[0x80..0x82], thumb("movs r0, #12").as_slice());
    assert_eq!(&img[0x88..0x8a], thumb("movs r2, #30").as_slice());
}

#[test]
fn repeated_speed_params_is_already_patched() {
    let mut img = speed_image();
    Patcher::new(&mut img, Model::Zt3Pro, &Thumb)
        .apply_feature(&feature("speed_params"))
        .unwrap();
    let patched = img.clone();

    let again = Patcher::new(&mut img, Model::Zt3Pro, &Thumb).apply_feature(&feature("speed_params"));
    assert!(matches!(
        again,
        Err(Error::AlreadyPatched { offset: 0x1c, .. })
    ));
    assert_eq!(img, patched);
}

#[test]
fn failed_speed_params_leaves_image_untouched() {
    let mut img = speed_image();
    let original = img.clone();

    // ped, drive and the first eco are written before the sport limit fails to encode
    let res = Patcher::new(&mut img, Model::Zt3Pro, &Thumb).apply_feature(&feature("speed_params=300:20:12:8"));
    assert!(matches!(res, Err(Error::Encoding { .. })));
    assert_eq!(img, original);
}

#[test]
fn failed_dpc_leaves_image_untouched() {
    let mut img = image(0x40, &[(0x10, &[0xaa, 0xf8, 0xec, 0x60, 0x42, 0x46])]);
    let original = img.clone();
    let res = Patcher::new(&mut img, Model::Zt3Pro, &Thumb).apply_feature(&Feature::Dpc);
    assert!(matches!(res, Err(Error::SignatureNotFound { .. })));
    assert_eq!(img, original);
}

#[test]
fn failed_apply_all_reverts_earlier_features() {
    let mut img = image(0x40, &[(0x10, MOTOR_NTC)]);
    let original = img.clone();
    let res = Patcher::new(&mut img, Model::Zt3Pro, &Thumb)
        .apply_all(&[Feature::DisableMotorNtc, Feature::RemoveKers]);
    assert!(matches!(res, Err(Error::Unsupported { .. })));
    assert_eq!(img, original);
}

#[test]
fn dpc_nops_and_stores_one() {
    let mut img = image(
        0x40,
        &[
            (0x10, &[0xaa, 0xf8, 0xec, 0x60, 0x42, 0x46]),
            (0x30, &[0xa0, 0xf8, 0x40, 0x50]),
        ],
    );
    let records = Patcher::new(&mut img, Model::F2Pro, &Thumb)
        .apply_feature(&Feature::Dpc)
        .unwrap();
    assert_eq!(names(&records), vec!["dpc_nop", "tmp_dpc_1"]);
    assert_eq!(records[0].post, thumb("nop.w"));
    assert_eq!(records[1].offset, 0x30);
    assert_eq!(records[1].post, thumb("strh.w r6,[r0,#0x1e]"));
}

#[test]
fn g2_dpc_branches_over_the_division() {
    let mut img = image(0x40, &[(0x20, &[0x90, 0xfb, 0xf2, 0xf0, 0x09, 0x68])]);
    let records = Patcher::new(&mut img, Model::G2, &Thumb)
        .apply_feature(&Feature::Dpc)
        .unwrap();
    assert_eq!(records[0].offset, 0x1e);
    assert_eq!(records[0].post, vec![0x01, 0xe0]);
}

fn cc_image(with_mode_store: bool) -> Vec<u8> {
    let mut chunks: Vec<(usize, &[u8])> = vec![(0x2010, &[0x4f, 0xf4, 0x7a, 0x71][..])];
    if with_mode_store {
        chunks.push((0x2030, &[0xa0, 0xf8, 0x42, 0x50][..]));
    }
    image(0x2100, &chunks)
}

#[test]
fn cc_delay_sets_delay_and_mode() {
    let mut img = cc_image(true);
    let records = Patcher::new(&mut img, Model::Zt3Pro, &Thumb)
        .apply_feature(&feature("cc_delay=2"))
        .unwrap();
    assert_eq!(names(&records), vec!["cc_delay", "tmp_cc_mode_1"]);
    // 2 s at 200 Hz
    assert_eq!(records[0].post, thumb("mov.w r1, #400"));
    assert_eq!(records[1].offset, 0x2030);
    assert_eq!(records[1].post, thumb("strh.w r6,[r0,#0x112]"));
}

#[test]
fn cc_delay_without_mode_store_only_sets_delay() {
    let mut img = cc_image(false);
    let records = Patcher::new(&mut img, Model::G3, &Thumb)
        .apply_feature(&feature("cc_delay=2"))
        .unwrap();
    assert_eq!(names(&records), vec!["cc_delay"]);
}

#[test]
fn allow_sn_change_forces_flag() {
    let mut img = image(0x40, &[(0x10, &[0x91, 0xf8, 0x24, 0x10])]);
    let records = Patcher::new(&mut img, Model::Zt3Pro, &Thumb)
        .apply_feature(&Feature::AllowSnChange)
        .unwrap();
    assert_eq!(records[0].offset, 0x10);
    assert_eq!(hex::encode(&records[0].post), "4ff00101");
}

const BMS_BAUD: &[u8] = &[
    0x4f, 0xf4, 0xe1, 0x30, 0x03, 0x90, 0x00, 0x21, 0xad, 0xf8, 0x10, 0x10,
];

#[test]
fn bms_baudrate_rewrites_constant() {
    let mut img = image(0x40, &[(0x10, BMS_BAUD)]);
    let records = Patcher::new(&mut img, Model::F2, &Thumb)
        .apply_feature(&feature("bms_baudrate=9600"))
        .unwrap();
    assert_eq!(records[0].post, thumb("mov.w r0, #9600"));
}

#[test]
fn stock_bms_baudrate_is_already_patched() {
    let mut img = image(0x40, &[(0x10, BMS_BAUD)]);
    let res = Patcher::new(&mut img, Model::F2, &Thumb).apply_feature(&feature("bms_baudrate=115200"));
    assert!(matches!(res, Err(Error::AlreadyPatched { offset: 0x10, .. })));
}

#[test]
fn ampere_eco_and_drive_follow_mode_table() {
    let mut img = image(0x60, &[(0x10, MODE_TABLE)]);
    let mut patcher = Patcher::new(&mut img, Model::G3, &Thumb);
    let eco = patcher.apply_feature(&feature("ampere_eco=12000")).unwrap();
    let drive = patcher.apply_feature(&feature("ampere_drive=22000")).unwrap();

    assert_eq!(eco[0].offset, 0x24);
    assert_eq!(eco[0].post, thumb("movw r12, #12000"));
    assert_eq!(drive[0].offset, 0x3a);
    assert_eq!(drive[0].post, thumb("movw r9, #22000"));
}

#[test]
fn g2_remove_charging_mode_nops_the_call() {
    let mut img = image(0x40, &[(0x20, &[0x7b, 0x20, 0xb9, 0x11, 0x79, 0x10, 0xb9, 0x22, 0xf8])]);
    let records = Patcher::new(&mut img, Model::G2, &Thumb)
        .apply_feature(&Feature::RemoveChargingMode)
        .unwrap();
    assert_eq!(records[0].name, "no_charge");
    assert_eq!(records[0].offset, 0x1b);
    assert_eq!(records[0].post, thumb("nop.w"));
}

#[test]
fn remove_charging_mode_nops_the_branch() {
    let mut img = image(0x40, &[(0x10, &[0x78, 0x8a, 0x28, 0xb1, 0x86, 0xf8, 0x38, 0x40])]);
    Patcher::new(&mut img, Model::Zt3Pro, &Thumb)
        .apply_feature(&Feature::RemoveChargingMode)
        .unwrap();
    assert_eq!(&img[0x12..0x14], [0x00, 0xbf]);
}

#[test]
fn g2_remove_kers_branches_to_return() {
    let mut img = image(
        0x60,
        &[
            (0x10, &[0x0f, 0x4a, 0xb2, 0xf8, 0xf6, 0x30, 0x73, 0xb1]),
            (0x40, &[0x00, 0x20, 0x08, 0x85, 0x70, 0x47]),
        ],
    );
    let records = Patcher::new(&mut img, Model::G2, &Thumb)
        .apply_feature(&Feature::RemoveKers)
        .unwrap();
    assert_eq!(records[0].offset, 0x16);
    assert_eq!(records[0].pre, vec![0x73, 0xb1]);
    assert_eq!(records[0].post, vec![0x13, 0xe0]);
}

#[test]
fn ampere_sport_patches_every_load() {
    let store: &[u8] = &[0x11, 0x71, 0xc7, 0xf8, 0x10, 0xc0];
    let mut img = image(
        0x8100,
        &[
            (0x8010, store),
            (0x8020, &[0xb8, 0x61]),
            (0x8040, store),
            (0x8050, &[0xb8, 0x61]),
        ],
    );
    let records = Patcher::new(&mut img, Model::F2Plus, &Thumb)
        .apply_feature(&feature("ampere_sport=30000"))
        .unwrap();

    // the scan ends quietly once no store is left
    assert_eq!(names(&records), vec!["ampere_sport_0", "ampere_sport_1"]);
    assert_eq!(records[0].offset, 0x801c);
    assert_eq!(records[1].offset, 0x804c);
    assert_eq!(records[1].post, thumb("movw r0, #30000"));
}

#[test]
fn ampere_sport_without_stores_changes_nothing() {
    let mut img = image(0x8100, &[]);
    let records = Patcher::new(&mut img, Model::F2Plus, &Thumb)
        .apply_feature(&feature("ampere_sport=30000"))
        .unwrap();
    assert!(records.is_empty());
}

const KERS_LEVELS: &[u8] = &[
    0x00, 0xeb, 0x40, 0x00, 0xc0, 0xf3, 0x94, 0x20, 0xaa, 0xf8, 0x38, 0x00, 0x0c, 0xe0, 0x00,
    0xeb, 0x40, 0x00, 0xc0, 0xf3, 0x54, 0x20, 0xaa, 0xf8, 0x38, 0x00, 0x05, 0xe0, 0x00, 0xeb,
    0x80, 0x00, 0xc0, 0xf3, 0x54, 0x20, 0xaa, 0xf8, 0x38, 0x00,
];

#[test]
fn kers_multi_rewrites_the_level_table() {
    let mut img = image(0x60, &[(0x10, KERS_LEVELS)]);
    let records = Patcher::new(&mut img, Model::Zt3Pro, &Thumb)
        .apply_feature(&feature("kers_multi"))
        .unwrap();

    assert_eq!(records[0].offset, 0x10);
    assert_eq!(records[0].pre, KERS_LEVELS);
    assert_eq!(
        hex::encode(&img[0x10..0x38]),
        concat!(
            "0622", "0de0", "aff30080", "aff30080", "00bf",
            "0c22", "06e0", "aff30080", "aff30080", "00bf",
            "1422", "00bf",
            "5043", "c00a", "aaf83800",
        )
    );
}

#[test]
fn kers_multi_rejects_short_program() {
    let short = |_: &str| -> Result<Vec<u8>, EncodeError> { Ok(vec![0x00; 38]) };
    let mut img = image(0x60, &[(0x10, KERS_LEVELS)]);
    let res = Patcher::new(&mut img, Model::G2, &short).apply_feature(&Feature::KersMulti { l0: 6, l1: 12, l2: 20 });
    assert!(matches!(
        res,
        Err(Error::LengthMismatch {
            expected: 40,
            actual: 38,
            ..
        })
    ));
}

#[test]
fn skip_key_check_candidate_at_image_end_is_not_found() {
    let mut img = image(0x30, &[(0x2a, &[0x40, 0x1c, 0x10, 0x28, 0x07, 0xdb])]);
    let res = Patcher::new(&mut img, Model::G2, &Thumb).apply_feature(&Feature::SkipKeyCheck);
    assert!(matches!(res, Err(Error::SignatureNotFound { .. })));
}
