use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::ConnectionTrait;

use crate::{
    entities::commerce::{product_variant, DiscountType, PromotionModel},
    errors::ServiceError,
    repositories::CatalogRepository,
};

/// Applied prices are kept to minor units.
const PRICE_SCALE: u32 = 2;

/// Monetary discount a promotion yields on `base_price`, within `[0, base_price]`.
pub fn discount_amount(promotion: &PromotionModel, base_price: Decimal) -> Decimal {
    let raw = match promotion.discount_type {
        DiscountType::Percentage => base_price * promotion.discount_value / Decimal::ONE_HUNDRED,
        DiscountType::FixedAmount => promotion.discount_value,
    };
    raw.max(Decimal::ZERO).min(base_price.max(Decimal::ZERO))
}

/// The active promotion with the largest discount and that discount.
///
/// Equal discounts keep the first one encountered, so a fixed input order
/// always yields the same choice.
pub fn best_promotion<'a>(
    promotions: &'a [PromotionModel],
    reference: DateTime<Utc>,
    base_price: Decimal,
) -> Option<(&'a PromotionModel, Decimal)> {
    let mut best: Option<(&PromotionModel, Decimal)> = None;

    for promotion in promotions.iter().filter(|p| p.is_active_at(reference)) {
        let discount = discount_amount(promotion, base_price);
        match best {
            Some((_, current)) if discount <= current => {}
            _ => best = Some((promotion, discount)),
        }
    }

    best
}

/// Price after the single best active promotion; `base_price` when none
/// applies or the best discount is zero. Never above `base_price`.
pub fn select_best_discount(
    promotions: &[PromotionModel],
    reference: DateTime<Utc>,
    base_price: Decimal,
) -> Decimal {
    match best_promotion(promotions, reference, base_price) {
        Some((_, discount)) if discount > Decimal::ZERO => (base_price - discount)
            .round_dp_with_strategy(PRICE_SCALE, RoundingStrategy::MidpointAwayFromZero)
            .min(base_price),
        _ => base_price,
    }
}

/// Loads the variant's promotions through `conn` and prices one unit at `reference`.
pub async fn applied_unit_price<C>(
    conn: &C,
    variant: &product_variant::Model,
    reference: DateTime<Utc>,
) -> Result<Decimal, ServiceError>
where
    C: ConnectionTrait,
{
    let promotions =
        CatalogRepository::list_active_promotions_for_variant(conn, variant.id, reference).await?;
    Ok(select_best_discount(&promotions, reference, variant.price))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use rstest::rstest;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn promo(kind: DiscountType, value: Decimal, start: DateTime<Utc>, end: DateTime<Utc>) -> PromotionModel {
        PromotionModel {
            id: Uuid::new_v4(),
            variant_id: Uuid::new_v4(),
            name: format!("{} {}", kind, value),
            discount_type: kind,
            discount_value: value,
            start_date: start,
            end_date: end,
            created_at: start,
        }
    }

    fn active(kind: DiscountType, value: Decimal) -> PromotionModel {
        let now = Utc::now();
        promo(kind, value, now - Duration::days(1), now + Duration::days(1))
    }

    #[rstest]
    #[case(DiscountType::Percentage, dec!(20), dec!(50), dec!(40))]
    #[case(DiscountType::Percentage, dec!(100), dec!(50), dec!(0))]
    #[case(DiscountType::Percentage, dec!(150), dec!(50), dec!(0))]
    #[case(DiscountType::FixedAmount, dec!(5), dec!(50), dec!(45))]
    #[case(DiscountType::FixedAmount, dec!(80), dec!(50), dec!(0))]
    #[case(DiscountType::Percentage, dec!(33.3333), dec!(9.99), dec!(6.66))]
    fn single_promotion_prices(
        #[case] kind: DiscountType,
        #[case] value: Decimal,
        #[case] base: Decimal,
        #[case] expected: Decimal,
    ) {
        let promotions = vec![active(kind, value)];
        assert_eq!(select_best_discount(&promotions, Utc::now(), base), expected);
    }

    #[test]
    fn no_promotion_keeps_base_price() {
        assert_eq!(select_best_discount(&[], Utc::now(), dec!(12.345)), dec!(12.345));
    }

    #[test]
    fn zero_discount_keeps_unrounded_base_price() {
        let promotions = vec![
            active(DiscountType::Percentage, dec!(0)),
            active(DiscountType::FixedAmount, dec!(0)),
        ];
        assert_eq!(select_best_discount(&promotions, Utc::now(), dec!(10.0051)), dec!(10.0051));
    }

    #[test]
    fn rounding_never_raises_the_price() {
        let promotions = vec![active(DiscountType::FixedAmount, dec!(0.0001))];
        assert_eq!(select_best_discount(&promotions, Utc::now(), dec!(10.0051)), dec!(10.0051));
        assert_eq!(select_best_discount(&promotions, Utc::now(), dec!(10.0001)), dec!(10.00));
    }

    #[test]
    fn inactive_promotions_are_ignored() {
        let now = Utc::now();
        let promotions = vec![
            promo(DiscountType::Percentage, dec!(50), now + Duration::hours(1), now + Duration::days(1)),
            promo(DiscountType::FixedAmount, dec!(10), now - Duration::days(2), now - Duration::days(1)),
        ];
        assert_eq!(select_best_discount(&promotions, now, dec!(50)), dec!(50));
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let now = Utc::now();
        let starts_now = promo(DiscountType::FixedAmount, dec!(1), now, now + Duration::days(1));
        let ends_now = promo(DiscountType::FixedAmount, dec!(2), now - Duration::days(1), now);

        assert_eq!(select_best_discount(&[starts_now], now, dec!(10)), dec!(9));
        assert_eq!(select_best_discount(&[ends_now], now, dec!(10)), dec!(8));
    }

    #[test]
    fn largest_absolute_discount_wins() {
        let promotions = vec![
            active(DiscountType::FixedAmount, dec!(5)),
            active(DiscountType::Percentage, dec!(20)),
            active(DiscountType::FixedAmount, dec!(8)),
        ];
        // 20% of 50 is 10, beating both fixed amounts
        assert_eq!(select_best_discount(&promotions, Utc::now(), dec!(50)), dec!(40));
        // 20% of 30 is 6, the fixed 8 wins
        assert_eq!(select_best_discount(&promotions, Utc::now(), dec!(30)), dec!(22));
    }

    #[test]
    fn ties_keep_first_encountered() {
        let first = active(DiscountType::FixedAmount, dec!(10));
        let second = active(DiscountType::Percentage, dec!(20));
        let promotions = vec![first.clone(), second.clone()];

        let (chosen, discount) = best_promotion(&promotions, Utc::now(), dec!(50)).unwrap();
        assert_eq!(chosen.id, first.id);
        assert_eq!(discount, dec!(10));

        let reversed = vec![second.clone(), first];
        let (chosen, _) = best_promotion(&reversed, Utc::now(), dec!(50)).unwrap();
        assert_eq!(chosen.id, second.id);
    }

    fn arb_promotion() -> impl Strategy<Value = PromotionModel> {
        (any::<bool>(), 0u32..20_000u32, -3i64..3i64).prop_map(|(percent, raw, offset)| {
            let now = Utc::now();
            let kind = if percent {
                DiscountType::Percentage
            } else {
                DiscountType::FixedAmount
            };
            let start = now + Duration::days(offset) - Duration::days(1);
            promo(kind, Decimal::new(raw as i64, 2), start, start + Duration::days(2))
        })
    }

    proptest! {
        #[test]
        fn applied_price_stays_within_bounds(
            promotions in proptest::collection::vec(arb_promotion(), 0..6),
            cents in 0i64..1_000_000i64,
        ) {
            let base = Decimal::new(cents, 2);
            let price = select_best_discount(&promotions, Utc::now(), base);
            prop_assert!(price >= Decimal::ZERO);
            prop_assert!(price <= base);
        }

        #[test]
        fn selection_is_deterministic(
            promotions in proptest::collection::vec(arb_promotion(), 0..6),
            cents in 0i64..1_000_000i64,
        ) {
            let base = Decimal::new(cents, 2);
            let reference = Utc::now();
            let first = best_promotion(&promotions, reference, base).map(|(p, d)| (p.id, d));
            let second = best_promotion(&promotions, reference, base).map(|(p, d)| (p.id, d));
            prop_assert_eq!(first, second);
        }
    }
}
