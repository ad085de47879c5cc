//! Property tests for the username codec, pricing arithmetic and tenant isolation.

use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;

use tenant_billing::prefix;
use tenant_billing::pricing::{self, LimitKey};
use tenant_billing::store::{Filter, FindOptions, Patch};
use tenant_billing::{BillingCycle, MemoryStore, Store, Student, SubscriptionTier, TenantGateway};

fn tier_strategy() -> impl Strategy<Value = SubscriptionTier> {
    prop_oneof![
        Just(SubscriptionTier::Trial),
        Just(SubscriptionTier::Basic),
        Just(SubscriptionTier::Standard),
        Just(SubscriptionTier::Premium),
        Just(SubscriptionTier::Enterprise),
    ]
}

fn paid_tier_strategy() -> impl Strategy<Value = SubscriptionTier> {
    prop_oneof![
        Just(SubscriptionTier::Basic),
        Just(SubscriptionTier::Standard),
        Just(SubscriptionTier::Premium),
    ]
}

fn cycle_strategy() -> impl Strategy<Value = BillingCycle> {
    prop_oneof![Just(BillingCycle::Monthly), Just(BillingCycle::Yearly)]
}

proptest! {
    /// Encoding then parsing gives back the prefix and the local name
    #[test]
    fn prefixed_usernames_parse_back(
        prefix_code in "[A-Z0-9]{3,8}",
        rest in "[a-z0-9][a-z0-9._-]{0,20}",
    ) {
        let encoded = prefix::encode(&prefix_code, &rest).unwrap();
        let parsed = prefix::parse(&encoded);
        prop_assert_eq!(parsed.prefix.as_deref(), Some(prefix_code.as_str()));
        prop_assert_eq!(parsed.rest, rest);
    }

    /// Lower-case heads never count as a prefix
    #[test]
    fn plain_usernames_stay_plain(head in "[a-z]{3,8}", tail in "[a-z0-9]{1,10}") {
        let username = format!("{head}_{tail}");
        let parsed = prefix::parse(&username);
        prop_assert!(!parsed.is_prefixed());
        prop_assert_eq!(parsed.rest, username);
    }

    /// Same name, same prefix; and every prefix is a valid code
    #[test]
    fn generated_prefixes_are_deterministic_and_valid(name in "[A-Za-z0-9 .'-]{0,60}") {
        let first = prefix::generate_prefix(&name);
        let second = prefix::generate_prefix(&name);
        prop_assert_eq!(&first, &second);
        prop_assert!(prefix::is_valid_prefix(&first), "invalid prefix {}", first);
    }

    /// Proration never goes negative and never exceeds the price difference
    #[test]
    fn proration_is_bounded(
        from in tier_strategy(),
        to in tier_strategy(),
        cycle in cycle_strategy(),
        total in 1u32..=366,
        remaining in 0u32..=400,
    ) {
        let current = pricing::get_plan(from, cycle, "IDR");
        let target = pricing::get_plan(to, cycle, "IDR");
        let owed = pricing::proration(&current, &target, remaining, total);
        prop_assert!(owed >= Decimal::ZERO);
        let ceiling = (target.price - current.price).max(Decimal::ZERO);
        prop_assert!(owed <= ceiling + Decimal::new(1, 2));
        if target.price <= current.price {
            prop_assert_eq!(owed, Decimal::ZERO);
        }
    }

    /// A full period owes the whole difference
    #[test]
    fn full_period_proration_is_the_price_gap(from in paid_tier_strategy(), total in 1u32..=366) {
        let current = pricing::get_plan(from, BillingCycle::Monthly, "IDR");
        let target = pricing::get_plan(SubscriptionTier::Premium, BillingCycle::Monthly, "IDR");
        let owed = pricing::proration(&current, &target, total, total);
        let gap = target.price - current.price;
        prop_assert!((owed - gap).abs() <= Decimal::new(1, 2));
    }

    /// Yearly billing is never dearer than twelve months
    #[test]
    fn yearly_price_is_discounted(tier in tier_strategy()) {
        let yearly = pricing::price(tier, BillingCycle::Yearly);
        let monthly = pricing::price(tier, BillingCycle::Monthly);
        prop_assert!(yearly <= monthly * Decimal::from(12));
    }

    /// The recommendation always fits the usage it was asked about
    #[test]
    fn recommended_tier_fits_usage(students in 0f64..5000.0, teachers in 0f64..400.0) {
        let tier = pricing::recommended_tier([
            (LimitKey::MaxStudents, students),
            (LimitKey::MaxTeachers, teachers),
        ]);
        prop_assert!(tier != SubscriptionTier::Trial);
        let limits = pricing::limits(tier);
        prop_assert!(limits.allows(LimitKey::MaxStudents, students));
        prop_assert!(limits.allows(LimitKey::MaxTeachers, teachers));
    }

    /// Percentages stay inside [0, 100]
    #[test]
    fn usage_percentage_is_clamped(tier in tier_strategy(), used in 0f64..1e7) {
        let pct = pricing::usage_percentage(tier, LimitKey::MaxStudents, used);
        prop_assert!((0.0..=100.0).contains(&pct));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Reads, updates and deletes through one tenant's gateway never touch another tenant's rows
    #[test]
    fn gateway_keeps_tenants_apart(
        tenant_a in "[a-z]{6,12}",
        tenant_b in "[a-z]{6,12}",
        count_a in 1usize..20,
        count_b in 1usize..20,
    ) {
        prop_assume!(tenant_a != tenant_b);
        tokio_test::block_on(async {
            let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
            let a = TenantGateway::new(store.clone(), tenant_a.clone());
            let b = TenantGateway::new(store.clone(), tenant_b.clone());

            let students_a: Vec<Student> = (0..count_a)
                .map(|i| Student::new(tenant_a.clone(), format!("a-{i}")))
                .collect();
            let students_b: Vec<Student> = (0..count_b)
                .map(|i| Student::new(tenant_b.clone(), format!("b-{i}")))
                .collect();
            a.create_many(&students_a).await.unwrap();
            b.create_many(&students_b).await.unwrap();

            assert_eq!(a.count::<Student>(&Filter::All).await.unwrap(), count_a as u64);
            assert_eq!(b.count::<Student>(&Filter::All).await.unwrap(), count_b as u64);

            // a known foreign id is invisible
            let foreign = &students_b[0].id;
            assert!(a.find_by_id::<Student>(foreign).await.unwrap().is_none());

            // naming the other tenant explicitly still yields nothing
            let sneaky = Filter::eq("tenant_id", tenant_b.as_str());
            let seen: Vec<Student> = a.find_many(&sneaky, &FindOptions::default()).await.unwrap();
            assert!(seen.is_empty());

            // bulk update cannot reach across, nor move rows between tenants
            let patch = Patch::new()
                .set("is_active", false).unwrap()
                .set("tenant_id", tenant_b.as_str()).unwrap();
            let updated = a.update_many::<Student>(&Filter::All, &patch).await.unwrap();
            assert_eq!(updated, count_a as u64);
            assert_eq!(a.count::<Student>(&Filter::All).await.unwrap(), count_a as u64);
            assert_eq!(b.count::<Student>(&Filter::eq("is_active", true)).await.unwrap(), count_b as u64);

            // inserting a row stamped for another tenant is refused
            assert!(a.create(&Student::new(tenant_b.clone(), "intruder".into())).await.is_err());

            let deleted = a.delete_many::<Student>(&Filter::All).await.unwrap();
            assert_eq!(deleted, count_a as u64);
            assert_eq!(b.count::<Student>(&Filter::All).await.unwrap(), count_b as u64);
        });
    }
}
