// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Cross-validation of the overlap classifier against a brute-force
//! byte-set intersector, including the fast-path abort cases.

use ::anyhow::Result;
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::collections::HashSet;
use ::taskring::{
    ensure_eq,
    DataType,
    OverlapMode,
    OverlapStatus,
    TensorDesc,
};

/// Seed for the descriptor generator. Fixed so failures reproduce.
const GENERATOR_SEED: u64 = 42;

/// Number of random descriptor pairs to cross-validate.
const NUM_PAIRS: usize = 400;

//======================================================================================================================
// Brute force reference
//======================================================================================================================

/// Collects every byte offset a descriptor touches, relative to its base.
fn byte_set(desc: &TensorDesc) -> HashSet<u64> {
    let elem: u64 = desc.element_size();
    let mut set: HashSet<u64> = HashSet::new();
    let mut idx: [u64; 8] = [0; 8];
    loop {
        let mut offset: u64 = desc.start_offset;
        for i in 0..desc.ndims {
            offset += idx[i] * desc.strides[i];
        }
        for byte in 0..elem {
            set.insert(offset * elem + byte);
        }

        let mut dim: i32 = desc.ndims as i32 - 1;
        while dim >= 0 {
            idx[dim as usize] += 1;
            if idx[dim as usize] < desc.repeats[dim as usize] {
                break;
            }
            idx[dim as usize] = 0;
            dim -= 1;
        }
        if dim < 0 {
            break;
        }
    }
    set
}

/// Generates a small, valid, normalized descriptor on `base`. Strides are
/// built inside-out so the no-self-aliasing invariants hold by
/// construction; a gap factor above one leaves holes between inner blocks.
fn random_desc(rng: &mut SmallRng, base: u64) -> TensorDesc {
    let ndims: usize = rng.gen_range(1..=3);
    let mut strides: Vec<u64> = vec![0; ndims];
    let mut repeats: Vec<u64> = vec![0; ndims];

    let mut stride: u64 = 1;
    for i in (0..ndims).rev() {
        strides[i] = stride;
        repeats[i] = rng.gen_range(1..=4);
        let gap: u64 = rng.gen_range(1..=2);
        stride *= repeats[i] * gap;
    }
    let start_offset: u64 = rng.gen_range(0..8);

    // Size the buffer to the farthest reachable element plus slack.
    let mut end: u64 = start_offset;
    for i in 0..ndims {
        end += strides[i] * (repeats[i] - 1);
    }
    let buffer_size: u64 = (end + 1) * 4 + 64;

    TensorDesc::new(
        base,
        buffer_size,
        start_offset,
        &strides,
        &repeats,
        DataType::Float32,
        0,
        OverlapMode::Accurate,
    )
    .unwrap()
}

//======================================================================================================================
// Tests
//======================================================================================================================

/// The classifier must agree with the brute-force intersector on whether
/// any byte is shared, across every fast path and the general fallback.
#[test]
fn classification_matches_brute_force() -> Result<()> {
    let mut rng: SmallRng = SmallRng::seed_from_u64(GENERATOR_SEED);
    let base: u64 = 0x4000;

    for round in 0..NUM_PAIRS {
        let reader: TensorDesc = random_desc(&mut rng, base);
        let writer: TensorDesc = random_desc(&mut rng, base);

        let status: OverlapStatus = reader.overlap(&writer);
        let reader_bytes: HashSet<u64> = byte_set(&reader);
        let writer_bytes: HashSet<u64> = byte_set(&writer);
        let truly_intersects: bool = !reader_bytes.is_disjoint(&writer_bytes);

        if (status != OverlapStatus::NoOverlap) != truly_intersects {
            anyhow::bail!(
                "round {}: classified {:?} but bytes {} ({:?} vs {:?})",
                round,
                status,
                if truly_intersects { "intersect" } else { "are disjoint" },
                reader,
                writer
            );
        }

        // A covering read really does reach every written byte.
        if status == OverlapStatus::Covered && !writer_bytes.is_subset(&reader_bytes) {
            anyhow::bail!("round {}: classified Covered but the writer escapes the reader", round);
        }

        // Disjointness is symmetric.
        if status == OverlapStatus::NoOverlap {
            ensure_eq!(writer.overlap(&reader), OverlapStatus::NoOverlap);
        }
    }
    Ok(())
}

/// Whenever a pair is classified as overlapping, the general enumerator
/// agrees, including pairs the fast paths classified.
#[test]
fn fast_paths_agree_with_general_path() -> Result<()> {
    let mut rng: SmallRng = SmallRng::seed_from_u64(GENERATOR_SEED + 1);
    let base: u64 = 0x8000;

    for _ in 0..NUM_PAIRS {
        let reader: TensorDesc = random_desc(&mut rng, base);
        let writer: TensorDesc = random_desc(&mut rng, base);

        let status: OverlapStatus = reader.overlap(&writer);
        let general: bool = reader.runs_intersect(&writer);
        ensure_eq!(status != OverlapStatus::NoOverlap, general);
    }
    Ok(())
}

/// Equal bases and dtypes with differing strides break the
/// hyper-rectangle precondition; the classifier must fall back to the
/// general enumerator and agree with it.
#[test]
fn fallback_on_incompatible_strides() -> Result<()> {
    let base: u64 = 0x1000;
    let coarse: TensorDesc =
        TensorDesc::new(base, 65536, 0, &[32, 1], &[8, 8], DataType::Float32, 0, OverlapMode::Accurate).unwrap();
    let fine: TensorDesc =
        TensorDesc::new(base, 65536, 8, &[16, 1], &[8, 8], DataType::Float32, 0, OverlapMode::Accurate).unwrap();

    let status: OverlapStatus = coarse.overlap(&fine);
    let general: bool = coarse.runs_intersect(&fine);
    ensure_eq!(status != OverlapStatus::NoOverlap, general);

    // And brute force agrees with both.
    let truly: bool = !byte_set(&coarse).is_disjoint(&byte_set(&fine));
    ensure_eq!(general, truly);
    Ok(())
}

/// An inner dimension that spills over its outer stride aborts the
/// per-dimension comparison even when the stride vectors match.
#[test]
fn fallback_on_spilling_inner_dimension() -> Result<()> {
    let base: u64 = 0x2000;
    // Strides [8, 1]: a view of six inner elements at inner offset four
    // spills into the next outer block.
    let spilling: TensorDesc =
        TensorDesc::new(base, 65536, 4, &[8, 1], &[4, 6], DataType::Float32, 0, OverlapMode::Accurate).unwrap();
    let tile: TensorDesc =
        TensorDesc::new(base, 65536, 8, &[8, 1], &[4, 4], DataType::Float32, 0, OverlapMode::Accurate).unwrap();

    let status: OverlapStatus = spilling.overlap(&tile);
    let truly: bool = !byte_set(&spilling).is_disjoint(&byte_set(&tile));
    ensure_eq!(status != OverlapStatus::NoOverlap, truly);
    Ok(())
}
