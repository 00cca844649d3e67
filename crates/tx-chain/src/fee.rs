use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::EngineError;

/// Fixed overhead (in vbytes) charged once per transaction.
const BASE_OVERHEAD_VBYTES: u64 = 100;

/// Marginal size of one output (in vbytes).
const OUTPUT_VBYTES: u64 = 31;

/// Fixed tail allowance (in vbytes).
const TAIL_ALLOWANCE_VBYTES: u64 = 10;

/// Service fee is one satoshi per started 100 payload bytes on top of the floor.
const SERVICE_FEE_BYTES_PER_SAT: u64 = 100;

const BPS_DENOMINATOR: u64 = 10_000;

/// Service fee before and after an eligibility discount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFee {
    pub full_sat: u64,
    pub discounted_sat: u64,
}

/// The fee budget of one planned operation. Derived, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePlan {
    pub network_fee_sat: u64,
    pub service_fee_sat: u64,
    pub discounted_service_fee_sat: u64,
    /// Value carried by the payloads themselves (inscription value model).
    pub total_payload_sat: u64,
    pub total_fee_sat: u64,
}

/// Inputs to [`plan_fees`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeePlanRequest<'a> {
    pub fee_rate_sat_vb: f64,
    pub payload_sizes: &'a [u64],
    pub total_tx_size_bytes: u64,
    pub output_count: u64,
    /// Untrusted percentage; clamped to `0..=100`.
    pub discount_percent: i64,
}

/// Reject NaN, infinities and negative rates before they reach fee math.
pub fn validate_fee_rate(fee_rate_sat_vb: f64) -> Result<(), EngineError> {
    if !fee_rate_sat_vb.is_finite() || fee_rate_sat_vb < 0.0 {
        return Err(EngineError::InvalidFeeRate(format!(
            "{fee_rate_sat_vb} sat/vB is not a finite non-negative rate"
        )));
    }
    Ok(())
}

/// Network fee: `ceil((100 + total_tx_size_bytes + 31 * output_count + 10) * fee_rate)`.
pub fn estimate_network_fee(
    fee_rate_sat_vb: f64,
    total_tx_size_bytes: u64,
    output_count: u64,
) -> Result<u64, EngineError> {
    validate_fee_rate(fee_rate_sat_vb)?;
    let vsize = BASE_OVERHEAD_VBYTES
        .saturating_add(total_tx_size_bytes)
        .saturating_add(OUTPUT_VBYTES.saturating_mul(output_count))
        .saturating_add(TAIL_ALLOWANCE_VBYTES);
    Ok((vsize as f64 * fee_rate_sat_vb).ceil() as u64)
}

/// Service fee with an optional discount.
///
/// `full = floor + ceil(payload_bytes / 100)` and
/// `discounted = ceil(full * (100 - discount) / 100)`.
pub fn estimate_service_fee(
    payload_bytes: u64,
    base_fee_floor_sat: u64,
    discount_percent: i64,
) -> ServiceFee {
    let discount = discount_percent.clamp(0, 100) as u64;
    let full_sat = base_fee_floor_sat.saturating_add(payload_bytes.div_ceil(SERVICE_FEE_BYTES_PER_SAT));
    let discounted_sat = full_sat.saturating_mul(100 - discount).div_ceil(100);
    ServiceFee {
        full_sat,
        discounted_sat,
    }
}

/// What the funding output must carry: network fee plus payload value.
pub fn estimate_total(plan: &FeePlan) -> u64 {
    plan.network_fee_sat.saturating_add(plan.total_payload_sat)
}

/// Percentage-of-amount fee used for order fills:
/// `max(floor(amount * bps / 10000), min_fee)`.
pub fn market_service_fee(amount_sat: u64, config: &EngineConfig) -> u64 {
    let proportional = (amount_sat as u128 * config.market_fee_bps as u128 / BPS_DENOMINATOR as u128) as u64;
    proportional.max(config.market_fee_min_sat)
}

/// Compose network and service fees for a planned operation.
pub fn plan_fees(request: &FeePlanRequest<'_>, config: &EngineConfig) -> Result<FeePlan, EngineError> {
    let network_fee_sat = estimate_network_fee(
        request.fee_rate_sat_vb,
        request.total_tx_size_bytes,
        request.output_count,
    )?;

    let total_payload_sat = request
        .payload_sizes
        .iter()
        .fold(0u64, |acc, size| acc.saturating_add(*size));

    let service = estimate_service_fee(
        total_payload_sat,
        config.service_fee_floor_sat,
        request.discount_percent,
    );

    Ok(FeePlan {
        network_fee_sat,
        service_fee_sat: service.full_sat,
        discounted_service_fee_sat: service.discounted_sat,
        total_payload_sat,
        total_fee_sat: network_fee_sat.saturating_add(service.discounted_sat),
    })
}

/// Shape of one chain link, as seen by a [`LinkFeePolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkShape {
    pub index: usize,
    /// Bytes of payload committed by this link. Only the commitment is on
    /// chain, so this does not contribute to `vsize`.
    pub payload_bytes: u64,
    /// Outputs of the priced transaction, including a refund if present.
    pub output_count: u64,
    /// Virtual size of the signed link.
    pub vsize: u64,
}

/// Decides how much network fee each link of a chain pays.
pub trait LinkFeePolicy {
    fn link_fee(&self, shape: &LinkShape) -> Result<u64, EngineError>;
}

/// The same fee for every link, regardless of its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedLinkFee(pub u64);

impl LinkFeePolicy for FixedLinkFee {
    fn link_fee(&self, _shape: &LinkShape) -> Result<u64, EngineError> {
        Ok(self.0)
    }
}

/// `ceil(vsize * fee_rate)`.
pub fn fee_for_vsize(fee_rate_sat_vb: f64, vsize: u64) -> Result<u64, EngineError> {
    validate_fee_rate(fee_rate_sat_vb)?;
    Ok((vsize as f64 * fee_rate_sat_vb).ceil() as u64)
}

/// Pays the fee rate on each link's own virtual size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeAwareLinkFee {
    pub fee_rate_sat_vb: f64,
}

impl LinkFeePolicy for SizeAwareLinkFee {
    fn link_fee(&self, shape: &LinkShape) -> Result<u64, EngineError> {
        fee_for_vsize(self.fee_rate_sat_vb, shape.vsize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_fee_formula() {
        // (100 + 250 + 31*2 + 10) * 2 = 844
        assert_eq!(estimate_network_fee(2.0, 250, 2).unwrap(), 844);
    }

    #[test]
    fn network_fee_rounds_up() {
        // (100 + 0 + 31 + 10) * 1.5 = 211.5
        assert_eq!(estimate_network_fee(1.5, 0, 1).unwrap(), 212);
    }

    #[test]
    fn network_fee_zero_rate() {
        assert_eq!(estimate_network_fee(0.0, 10_000, 5).unwrap(), 0);
    }

    #[test]
    fn network_fee_rejects_bad_rates() {
        assert!(estimate_network_fee(-1.0, 0, 1).is_err());
        assert!(estimate_network_fee(f64::NAN, 0, 1).is_err());
        assert!(estimate_network_fee(f64::INFINITY, 0, 1).is_err());
    }

    #[test]
    fn network_fee_is_monotonic_in_each_argument() {
        let rates = [0.0, 0.5, 1.0, 2.25, 10.0, 57.3];
        let sizes = [0u64, 1, 99, 1_000, 50_000];
        let outputs = [0u64, 1, 2, 5, 40];

        for &rate in &rates {
            for &size in &sizes {
                for pair in outputs.windows(2) {
                    let lo = estimate_network_fee(rate, size, pair[0]).unwrap();
                    let hi = estimate_network_fee(rate, size, pair[1]).unwrap();
                    assert!(lo <= hi, "outputs {pair:?} at rate {rate}, size {size}");
                }
            }
        }
        for &out in &outputs {
            for &size in &sizes {
                for pair in rates.windows(2) {
                    let lo = estimate_network_fee(pair[0], size, out).unwrap();
                    let hi = estimate_network_fee(pair[1], size, out).unwrap();
                    assert!(lo <= hi, "rates {pair:?} at size {size}, outputs {out}");
                }
            }
        }
        for &rate in &rates {
            for &out in &outputs {
                for pair in sizes.windows(2) {
                    let lo = estimate_network_fee(rate, pair[0], out).unwrap();
                    let hi = estimate_network_fee(rate, pair[1], out).unwrap();
                    assert!(lo <= hi, "sizes {pair:?} at rate {rate}, outputs {out}");
                }
            }
        }
    }

    #[test]
    fn service_fee_with_quarter_discount() {
        let fee = estimate_service_fee(10_000, 1_000, 25);
        assert_eq!(fee.full_sat, 1_100);
        assert_eq!(fee.discounted_sat, 825);
    }

    #[test]
    fn service_fee_rounds_partial_hundreds_up() {
        let fee = estimate_service_fee(101, 0, 0);
        assert_eq!(fee.full_sat, 2);
        assert_eq!(fee.discounted_sat, 2);
    }

    #[test]
    fn discount_is_clamped() {
        assert_eq!(estimate_service_fee(0, 1_000, 150).discounted_sat, 0);
        assert_eq!(estimate_service_fee(0, 1_000, -20).discounted_sat, 1_000);
    }

    #[test]
    fn discounted_fee_rounds_up() {
        // 1001 * 67 / 100 = 670.67
        assert_eq!(estimate_service_fee(100, 1_000, 33).discounted_sat, 671);
    }

    #[test]
    fn market_fee_uses_floor_for_small_amounts() {
        let cfg = EngineConfig::default();
        assert_eq!(market_service_fee(10_000, &cfg), 1_000);
    }

    #[test]
    fn market_fee_is_proportional_above_floor() {
        let cfg = EngineConfig::default();
        // 1% of 1_234_567 = 12_345.67 -> floor
        assert_eq!(market_service_fee(1_234_567, &cfg), 12_345);
    }

    #[test]
    fn plan_combines_fees() {
        let sizes = [4_000u64, 6_000];
        let plan = plan_fees(
            &FeePlanRequest {
                fee_rate_sat_vb: 1.0,
                payload_sizes: &sizes,
                total_tx_size_bytes: 300,
                output_count: 2,
                discount_percent: 25,
            },
            &EngineConfig::default(),
        )
        .unwrap();

        assert_eq!(plan.network_fee_sat, 472);
        assert_eq!(plan.total_payload_sat, 10_000);
        assert_eq!(plan.service_fee_sat, 1_100);
        assert_eq!(plan.discounted_service_fee_sat, 825);
        assert_eq!(plan.total_fee_sat, 472 + 825);
        assert_eq!(estimate_total(&plan), 472 + 10_000);
    }

    #[test]
    fn link_fee_policies() {
        let shape = LinkShape {
            index: 0,
            payload_bytes: 500,
            output_count: 2,
            vsize: 159,
        };
        assert_eq!(FixedLinkFee(200).link_fee(&shape).unwrap(), 200);
        let sized = SizeAwareLinkFee { fee_rate_sat_vb: 3.0 };
        assert_eq!(sized.link_fee(&shape).unwrap(), 477);
    }

    #[test]
    fn size_aware_fee_ignores_payload_bytes() {
        let small = LinkShape {
            index: 0,
            payload_bytes: 10,
            output_count: 2,
            vsize: 159,
        };
        let large = LinkShape {
            payload_bytes: 390_000,
            ..small
        };
        let sized = SizeAwareLinkFee { fee_rate_sat_vb: 2.5 };
        // 159 * 2.5 = 397.5
        assert_eq!(sized.link_fee(&small).unwrap(), 398);
        assert_eq!(sized.link_fee(&large).unwrap(), 398);
        assert!(sized.link_fee(&LinkShape { vsize: 202, ..small }).unwrap() > 398);
    }
}
