//! Load / mutate / flush scenarios across the whole context crate.

use std::collections::HashSet;
use std::sync::Arc;

use procvar_codec::{
    ByteCodec, DecodingError, Mutability, ResolveError, TypeDescriptor, TypeRegistry,
};
use procvar_context::AccessError;
use procvar_context::{
    ControllerOptions, FlushFailureCause, MemoryStore, NamedObjects, StoreError,
    VariableController, VariableError, VariableStore,
};
use procvar_types::{ExecutionId, FlushPolicy, NativeHandle, SlotKey, TypeName, Value, VariableSlot};

fn name(s: &str) -> TypeName {
    TypeName::new(s).expect("valid type name")
}

fn registry() -> Arc<TypeRegistry> {
    let mut registry = TypeRegistry::new();
    for type_name in ["Amount", "Item"] {
        registry
            .register(TypeDescriptor::new(name(type_name)))
            .expect("register");
    }
    Arc::new(registry)
}

fn amount(sku: &str) -> Value {
    Value::object(
        name("Amount"),
        [
            ("total", Value::Int(10)),
            (
                "items",
                Value::list([Value::object(name("Item"), [("sku", Value::from(sku))])]),
            ),
        ],
    )
}

/// Store seeded with an encoded "amount" variable.
fn seeded(controller: &VariableController, slot: &SlotKey) -> MemoryStore {
    let mut store = MemoryStore::new();
    let bytes = controller.codec().encode(&amount("A")).expect("encode");
    store.insert(slot.clone(), bytes);
    store
}

/// Store whose writes fail for one slot.
struct FailingStore {
    inner: MemoryStore,
    broken: HashSet<SlotKey>,
}

impl VariableStore for FailingStore {
    fn read_bytes(&self, slot: &SlotKey) -> Result<Vec<u8>, StoreError> {
        self.inner.read_bytes(slot)
    }

    fn write_bytes(&mut self, slot: &SlotKey, bytes: &[u8]) -> Result<(), StoreError> {
        if self.broken.contains(slot) {
            return Err(StoreError::backend(slot.clone(), "disk full"));
        }
        self.inner.write_bytes(slot, bytes)
    }
}

#[test]
fn nested_mutation_through_proxies_is_flushed_once() {
    let controller = VariableController::new(registry());
    let slot = VariableSlot::owned_by("amount", ExecutionId::new(7));
    let mut store = seeded(&controller, slot.key());

    {
        let mut unit = controller.begin(&mut store);
        let value = unit.load_slot(&slot).expect("load");
        value
            .get("items")
            .and_then(|items| items.at(0))
            .and_then(|item| item.set("sku", "B"))
            .expect("mutate through proxies");
        let report = unit.commit().expect("commit");
        assert_eq!(report.written, vec![slot.key().clone()]);
    }
    assert_eq!(store.writes_to(slot.key()), 1);

    let mut unit = controller.begin(&mut store);
    let fresh = unit.load_slot(&slot).expect("reload");
    assert_eq!(fresh, amount("B"));
    assert!(fresh.ptr_eq(&unit.load(slot.key()).expect("same slot by key")));
}

#[test]
fn owned_slot_stores_under_its_key() {
    let controller = VariableController::new(registry());
    let slot = VariableSlot::owned_by("amount", ExecutionId::new(3));
    let mut store = MemoryStore::new();
    {
        let mut unit = controller.begin(&mut store);
        unit.store_slot(&slot, amount("C")).expect("store");
        unit.store_slot(&slot, amount("C")).expect("store again");
        unit.commit().expect("commit");
    }
    assert_eq!(store.writes_to(slot.key()), 1);
    let mut unit = controller.begin(&mut store);
    assert_eq!(unit.load(slot.key()).expect("load"), amount("C"));
}

#[test]
fn repeated_loads_return_the_same_proxy() {
    let controller = VariableController::new(registry());
    let slot = SlotKey::new("amount");
    let mut store = seeded(&controller, &slot);
    let mut unit = controller.begin(&mut store);

    let first = unit.load(&slot).expect("load");
    let second = unit.load(&slot).expect("load");
    assert!(first.is_tracked());
    assert!(first.ptr_eq(&second));

    let items_a = first.get("items").expect("items");
    let items_b = second.get("items").expect("items");
    assert!(items_a.ptr_eq(&items_b));
}

#[test]
fn flush_without_mutation_writes_nothing() {
    let controller = VariableController::new(registry());
    let slot = SlotKey::new("amount");
    let mut store = seeded(&controller, &slot);
    {
        let mut unit = controller.begin(&mut store);
        let value = unit.load(&slot).expect("load");
        let _ = value.get("total").expect("read");
        let report = unit.commit().expect("commit");
        assert_eq!(report.writes(), 0);
        assert_eq!(report.unchanged, 1);
    }
    assert_eq!(store.total_writes(), 0);
}

#[test]
fn identical_stores_collapse_to_one_write() {
    let controller = VariableController::new(registry());
    let slot = SlotKey::new("amount");
    let mut store = MemoryStore::new();
    {
        let mut unit = controller.begin(&mut store);
        unit.store(&slot, amount("A")).expect("first store");
        unit.store(&slot, amount("A")).expect("second store");
        let report = unit.commit().expect("commit");
        assert_eq!(report.writes(), 0);
    }
    assert_eq!(store.writes_to(&slot), 1);
}

#[test]
fn stored_then_loaded_value_is_not_rewritten() {
    let controller = VariableController::new(registry());
    let slot = SlotKey::new("amount");
    let mut store = seeded(&controller, &slot);
    {
        let mut unit = controller.begin(&mut store);
        let value = unit.load(&slot).expect("load");
        unit.store(&slot, value).expect("store unchanged");
        unit.commit().expect("commit");
    }
    assert_eq!(store.total_writes(), 0);
}

#[test]
fn leaf_variables_are_plain() {
    let controller = VariableController::new(registry());
    let slot = SlotKey::new("customer");
    let mut store = MemoryStore::new();
    {
        let mut unit = controller.begin(&mut store);
        unit.store(&slot, "Ada").expect("store");
        unit.commit().expect("commit");
    }

    let mut unit = controller.begin(&mut store);
    let loaded = unit.load(&slot).expect("load");
    assert!(!loaded.is_tracked());
    assert_eq!(loaded.as_text(), Some("Ada"));
}

#[test]
fn unknown_stored_type_fails_to_load() {
    let writer = VariableController::new({
        let mut registry = TypeRegistry::new();
        registry
            .register(TypeDescriptor::new(name("Retired")))
            .expect("register");
        Arc::new(registry)
    });
    let bytes = writer
        .codec()
        .encode(&Value::object(name("Retired"), [("x", Value::Int(1))]))
        .expect("encode");

    let slot = SlotKey::new("legacy");
    let mut store = MemoryStore::new();
    store.insert(slot.clone(), bytes);

    let controller = VariableController::new(registry());
    let mut unit = controller.begin(&mut store);
    let err = unit.load(&slot).expect_err("type is not registered");
    match &err {
        VariableError::Decode { slot: failed, source } => {
            assert_eq!(failed, &slot);
            assert_eq!(
                source,
                &DecodingError::Unresolved(ResolveError::UnknownType {
                    type_name: name("Retired")
                })
            );
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.to_string(), "couldn't deserialize variable legacy");
    assert!(!unit.is_loaded(&slot));
    assert!(!unit.is_registered(&slot));
}

#[test]
fn missing_variable_is_not_found() {
    let controller = VariableController::new(registry());
    let mut store = MemoryStore::new();
    let mut unit = controller.begin(&mut store);
    let err = unit.load(&SlotKey::new("nothing")).expect_err("absent");
    assert!(matches!(err, VariableError::Store(StoreError::NotFound(_))));
}

#[test]
fn one_unencodable_slot_does_not_block_the_rest() {
    let controller = VariableController::new(registry());
    let broken = SlotKey::new("broken");
    let healthy = SlotKey::new("healthy");
    let mut store = MemoryStore::new();
    for slot in [&broken, &healthy] {
        let bytes = controller.codec().encode(&amount("A")).expect("encode");
        store.insert(slot.clone(), bytes);
    }

    {
        let mut unit = controller.begin(&mut store);
        let bad = unit.load(&broken).expect("load");
        bad.set("handle", Value::Native(NativeHandle::new("socket", 3u16)))
            .expect("set native");
        let good = unit.load(&healthy).expect("load");
        good.set("total", 11_i64).expect("set total");

        let err = unit.commit().expect_err("native value is not encodable");
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].slot, broken);
        assert!(matches!(err.failures[0].cause, FlushFailureCause::Encode(_)));
        assert_eq!(err.report.written, vec![healthy.clone()]);
    }
    assert_eq!(store.writes_to(&healthy), 1);
    assert_eq!(store.writes_to(&broken), 0);
}

#[test]
fn failed_write_is_retried_on_next_flush() {
    let controller = VariableController::new(registry());
    let slot = SlotKey::new("amount");
    let mut store = FailingStore {
        inner: seeded(&controller, &slot),
        broken: HashSet::from([slot.clone()]),
    };

    let mut unit = controller.begin(&mut store);
    let value = unit.load(&slot).expect("load");
    value.set("total", 12_i64).expect("set");

    let err = unit.flush().expect_err("backend rejects the write");
    assert!(matches!(err.failures[0].cause, FlushFailureCause::Store(_)));
    let stale = unit.baseline(&slot).map(<[u8]>::to_vec);
    assert_eq!(stale, unit.storage().inner.get(&slot).map(<[u8]>::to_vec));

    // Still dirty: the next flush attempts it again and fails the same way.
    let err = unit.flush().expect_err("still broken");
    assert_eq!(err.failed_slots().count(), 1);
}

#[test]
fn touched_only_policy_skips_untouched_slots() {
    let controller = VariableController::new(registry()).with_options(ControllerOptions {
        proxying: true,
        flush_policy: FlushPolicy::TouchedOnly,
    });
    let read = SlotKey::new("read");
    let written = SlotKey::new("written");
    let mut store = MemoryStore::new();
    for slot in [&read, &written] {
        let bytes = controller.codec().encode(&amount("A")).expect("encode");
        store.insert(slot.clone(), bytes);
    }

    {
        let mut unit = controller.begin(&mut store);
        let _ = unit.load(&read).expect("load").get("total").expect("read");
        unit.load(&written)
            .expect("load")
            .set("total", 20_i64)
            .expect("write");
        let report = unit.commit().expect("commit");
        assert_eq!(report.skipped, 1);
        assert_eq!(report.written, vec![written.clone()]);
    }
    assert_eq!(store.total_writes(), 1);
}

#[test]
fn unwrapped_mutation_is_still_detected() {
    let controller = VariableController::new(registry()).with_options(ControllerOptions {
        proxying: true,
        flush_policy: FlushPolicy::TouchedOnly,
    });
    let slot = SlotKey::new("amount");
    let mut store = seeded(&controller, &slot);
    {
        let mut unit = controller.begin(&mut store);
        let real = unit.load(&slot).expect("load").unwrap();
        real.as_object()
            .expect("object")
            .set("total", Value::Int(99));
        assert!(unit.tracker(&slot).expect("registered").is_degraded());
        let report = unit.commit().expect("commit");
        assert_eq!(report.writes(), 1);
    }
    assert_eq!(store.writes_to(&slot), 1);
}

#[test]
fn disabled_proxying_still_flushes_changes() {
    let controller = VariableController::new(registry()).with_options(ControllerOptions {
        proxying: false,
        flush_policy: FlushPolicy::TouchedOnly,
    });
    let slot = SlotKey::new("amount");
    let mut store = seeded(&controller, &slot);
    {
        let mut unit = controller.begin(&mut store);
        let value = unit.load(&slot).expect("load");
        assert!(!value.is_tracked());
        value
            .get("items")
            .and_then(|items| items.at(0))
            .and_then(|item| item.set("sku", "C"))
            .expect("plain mutation");
        unit.commit().expect("commit");
    }

    let mut unit = controller.begin(&mut store);
    assert_eq!(unit.load(&slot).expect("reload"), amount("C"));
}

#[test]
fn fresh_unit_decodes_again() {
    let controller = VariableController::new(registry());
    let slot = SlotKey::new("amount");
    let mut store = seeded(&controller, &slot);

    let first = {
        let mut unit = controller.begin(&mut store);
        unit.load(&slot).expect("load")
    };
    let second = {
        let mut unit = controller.begin(&mut store);
        unit.load(&slot).expect("load")
    };
    assert!(!first.ptr_eq(&second));
    assert_eq!(first, second);
}

#[test]
fn proxy_outliving_its_unit_is_detached() {
    let controller = VariableController::new(registry());
    let slot = SlotKey::new("amount");
    let mut store = seeded(&controller, &slot);

    let kept = {
        let mut unit = controller.begin(&mut store);
        let value = unit.load(&slot).expect("load");
        unit.commit().expect("commit");
        value
    };
    kept.set("total", 1_i64).expect("write on detached proxy");
    assert_eq!(store.total_writes(), 0);
}

#[test]
fn named_reference_round_trips_through_a_variable() {
    let controller = VariableController::new(registry());
    let names = NamedObjects::new();
    names.bind("mailer", String::from("smtp://localhost")).expect("bind");

    let slot = SlotKey::new("mailer");
    let mut store = MemoryStore::new();
    {
        let mut unit = controller.begin(&mut store);
        unit.store(&slot, NamedObjects::reference("mailer")).expect("store");
        unit.commit().expect("commit");
    }

    let mut unit = controller.begin(&mut store);
    let loaded = unit.load(&slot).expect("load");
    assert!(!loaded.is_tracked());
    assert!(loaded.is_frozen());
    let mailer = names
        .resolve::<String>(&loaded.unwrap())
        .expect("resolve");
    assert_eq!(mailer.as_str(), "smtp://localhost");
}

#[test]
fn storing_a_proxy_from_another_slot_copies_its_value() {
    let controller = VariableController::new(registry());
    let source = SlotKey::new("source");
    let copy = SlotKey::new("copy");
    let mut store = seeded(&controller, &source);
    {
        let mut unit = controller.begin(&mut store);
        let value = unit.load(&source).expect("load");
        unit.store(&copy, value).expect("store copy");
        assert!(unit.tracker(&source).expect("source").is_degraded());
        assert!(unit.tracker(&copy).expect("copy").is_degraded());
        unit.commit().expect("commit");
    }
    assert_eq!(store.get(&copy), store.get(&source));

    let codec = ByteCodec::new(registry());
    let decoded = codec
        .decode(store.get(&copy).expect("written"))
        .expect("decode");
    assert_eq!(decoded, amount("A"));
}

#[test]
fn immutable_values_reject_writes_instead_of_losing_them() {
    let mut registry = TypeRegistry::new();
    for type_name in ["Amount", "Item"] {
        registry
            .register(TypeDescriptor::new(name(type_name)))
            .expect("register");
    }
    registry
        .register(TypeDescriptor::new(name("Money")).mutability(Mutability::Immutable))
        .expect("register Money");
    let controller = VariableController::new(Arc::new(registry)).with_options(ControllerOptions {
        proxying: true,
        flush_policy: FlushPolicy::TouchedOnly,
    });
    let slot = SlotKey::new("amount");
    let money = |cents| Value::object(name("Money"), [("cents", Value::Int(cents))]);
    let mut store = MemoryStore::new();
    let stored = Value::object(name("Amount"), [("price", money(5))]);
    store.insert(slot.clone(), controller.codec().encode(&stored).expect("encode"));

    {
        let mut unit = controller.begin(&mut store);
        let value = unit.load(&slot).expect("load");
        let price = value.get("price").expect("price");
        assert!(price.is_frozen());
        assert_eq!(
            price.set("cents", 7_i64),
            Err(AccessError::Immutable {
                type_name: name("Money")
            })
        );
        let report = unit.commit().expect("commit");
        assert_eq!(report.writes(), 0);
    }
    assert_eq!(store.total_writes(), 0);

    {
        let mut unit = controller.begin(&mut store);
        let value = unit.load(&slot).expect("load");
        value.set("price", money(7)).expect("replace price");
        let report = unit.commit().expect("commit");
        assert_eq!(report.written, vec![slot.clone()]);
    }
    let mut unit = controller.begin(&mut store);
    let value = unit.load(&slot).expect("reload");
    let cents = value.get("price").and_then(|price| price.get("cents")).expect("cents");
    assert_eq!(cents.as_int(), Some(7));
}

#[test]
fn blob_from_older_layout_is_not_rewritten_until_changed() {
    let slot = SlotKey::new("amount");
    let writer = VariableController::new(registry());
    let mut store = seeded(&writer, &slot);

    let mut evolved = TypeRegistry::new();
    evolved
        .register(TypeDescriptor::new(name("Amount")).fields(["total", "items", "currency"]))
        .expect("register Amount");
    evolved
        .register(TypeDescriptor::new(name("Item")))
        .expect("register Item");
    let reader = VariableController::new(Arc::new(evolved));

    {
        let mut unit = reader.begin(&mut store);
        let value = unit.load(&slot).expect("load");
        assert_eq!(value.get("currency").expect("defaulted").unwrap(), Value::Null);
        let stored = unit.storage().read_bytes(&slot).expect("stored");
        assert_ne!(unit.baseline(&slot), Some(stored.as_slice()));
        let report = unit.commit().expect("commit");
        assert_eq!(report.writes(), 0);
    }
    assert_eq!(store.total_writes(), 0);

    {
        let mut unit = reader.begin(&mut store);
        unit.load(&slot)
            .expect("load")
            .set("currency", "EUR")
            .expect("write");
        let report = unit.commit().expect("commit");
        assert_eq!(report.written, vec![slot.clone()]);
    }
    let mut unit = reader.begin(&mut store);
    let value = unit.load(&slot).expect("reload");
    assert_eq!(value.get("currency").expect("currency").as_text(), Some("EUR"));
    assert_eq!(unit.commit().expect("commit").writes(), 0);
}
