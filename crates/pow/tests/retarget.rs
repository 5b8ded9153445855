use powd_consensus::params::{consensus_params, Network};
use powd_pow::difficulty::{
    compact_to_u256, difficulty_from_bits, next_work_required, retarget, target_to_compact,
    u256_to_f64, HeaderInfo,
};
use powd_pow::DifficultyAdjuster;

fn run_window(spacing: i64, start_bits: u32) -> DifficultyAdjuster {
    let params = consensus_params(Network::Regtest);
    let mut adjuster = DifficultyAdjuster::new(&params);
    let interval = params.difficulty_adjustment_interval as u64;
    for height in 0..interval {
        let bits = if height == 0 {
            start_bits
        } else {
            adjuster.next_bits()
        };
        adjuster
            .adjust(&HeaderInfo {
                height,
                time: 1_000_000 + height as i64 * spacing,
                bits,
            })
            .expect("adjust");
    }
    adjuster
}

#[test]
fn no_op_window_keeps_difficulty() {
    let params = consensus_params(Network::Regtest);
    let bits = 0x1f3f_ffff;
    let adjuster = run_window(params.target_spacing_secs, bits);
    assert_eq!(adjuster.next_bits(), bits);
}

#[test]
fn twice_as_fast_doubles_difficulty() {
    let params = consensus_params(Network::Regtest);
    let before = difficulty_from_bits(params.genesis_bits, &params).expect("difficulty");
    let adjuster = run_window(params.target_spacing_secs / 2, params.genesis_bits);
    let ratio = adjuster.get_difficulty() / before;
    // Nine real half-spaced intervals plus the synthetic genesis interval.
    let expected = 10.0 / 5.5;
    assert!((ratio - expected).abs() < 1e-3, "ratio {ratio}");
}

#[test]
fn steady_fast_window_doubles_difficulty() {
    let params = consensus_params(Network::Regtest);
    let start_bits = 0x1f3f_ffff;
    let interval = params.difficulty_adjustment_interval as u64;
    let spacing = params.target_spacing_secs / 2;
    let chain: Vec<HeaderInfo> = (interval - 1..=2 * interval - 1)
        .map(|height| HeaderInfo {
            height,
            time: 2_000_000 + height as i64 * spacing,
            bits: start_bits,
        })
        .collect();
    let adjuster = DifficultyAdjuster::rebuild(&params, &chain).expect("rebuild");
    let next = next_work_required(&chain, &params).expect("next work");
    assert_eq!(next, adjuster.next_bits());

    let before = difficulty_from_bits(start_bits, &params).expect("difficulty");
    let ratio = adjuster.get_difficulty() / before;
    assert!((ratio - 2.0).abs() < 1e-3, "ratio {ratio}");
}

#[test]
fn ratio_is_clamped_to_four() {
    let params = consensus_params(Network::Regtest);
    let bits = 0x1f3f_ffff;
    let expected = params.expected_window_timespan();

    let faster = retarget(bits, 1, expected, &params).expect("retarget");
    let ratio = u256_to_f64(compact_to_u256(bits).expect("old"))
        / u256_to_f64(compact_to_u256(faster).expect("new"));
    assert!((ratio - 4.0).abs() < 1e-3, "ratio {ratio}");

    let slower = retarget(0x1e3f_ffff, expected * 100, expected, &params).expect("retarget");
    let ratio = u256_to_f64(compact_to_u256(slower).expect("new"))
        / u256_to_f64(compact_to_u256(0x1e3f_ffff).expect("old"));
    assert!((ratio - 4.0).abs() < 1e-3, "ratio {ratio}");
}

#[test]
fn target_never_exceeds_limit_or_floor() {
    let params = consensus_params(Network::Regtest);
    let expected = params.expected_window_timespan();
    let limit_bits = target_to_compact(&params.pow_limit);
    assert_eq!(
        retarget(limit_bits, expected * 4, expected, &params).expect("retarget"),
        limit_bits
    );
    let floor_bits = target_to_compact(&params.pow_floor);
    assert_eq!(
        retarget(floor_bits, 1, expected, &params).expect("retarget"),
        floor_bits
    );
}
