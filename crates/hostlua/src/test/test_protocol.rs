// Tests for script-side access to foreign handles
use std::collections::HashMap;

use crate::*;

// ==================== Test structs ====================

#[derive(HostRecord)]
pub struct Counter {
    pub name: String,
    pub count: i64,
    #[host(readonly)]
    pub id: i64,
}

#[host_methods]
impl Counter {
    pub fn add(&mut self, amount: i64) -> i64 {
        self.count += amount;
        self.count
    }

    pub fn add_pair(&mut self, a: i64, b: i64) -> i64 {
        self.count += a + b;
        self.count
    }

    pub fn label(&self) -> String {
        format!("{}={}", self.name, self.count)
    }

    pub fn absorb(&mut self, other: Shared<Counter>) -> i64 {
        self.count += other.lock().count;
        self.count
    }

    pub fn checked(&self, limit: i64) -> Result<i64, String> {
        if self.count > limit {
            Err(format!("{} exceeds {limit}", self.count))
        } else {
            Ok(limit - self.count)
        }
    }
}

#[derive(Clone, HostRecord)]
#[host_impl(Clone)]
pub struct Spot {
    pub x: i64,
    pub y: i64,
}

#[derive(HostRecord)]
pub struct Bag {
    pub tags: HashMap<String, i64>,
    pub items: Vec<i64>,
    pub spot: Spot,
    pub notes: HashMap<String, Option<i64>>,
}

#[host_methods]
impl Bag {
    pub fn place(&mut self, spot: Spot) -> i64 {
        self.spot = spot;
        self.spot.x + self.spot.y
    }
}

#[derive(HostRecord)]
pub struct Stats {
    pub hp: i64,
}

#[host_methods]
impl Stats {
    pub fn heal(&mut self, amount: i64) -> i64 {
        self.hp += amount;
        self.hp
    }
}

#[derive(HostRecord)]
pub struct Hero {
    #[host(flatten)]
    pub stats: Stats,
    pub name: String,
}

fn counter(name: &str, count: i64) -> Counter {
    Counter {
        name: name.to_string(),
        count,
        id: 1,
    }
}

fn bag() -> Bag {
    let mut notes = HashMap::new();
    notes.insert("kept".to_string(), Some(1));
    notes.insert("empty".to_string(), None);
    Bag {
        tags: HashMap::new(),
        items: vec![1, 2],
        spot: Spot { x: 0, y: 0 },
        notes,
    }
}

fn bridge_with(name: &str, value: impl IntoHost) -> Bridge {
    let bridge = Bridge::new(true).unwrap();
    bridge.push_value(value).unwrap();
    bridge.engine().set_global(name).unwrap();
    bridge
}

fn run_err(bridge: &Bridge, source: &str) -> String {
    match bridge.load_and_run(source, "test") {
        Err(BridgeError::Runtime { message, .. }) => message,
        other => panic!("expected runtime error, got {other:?}"),
    }
}

// ==================== Records ====================

#[test]
fn test_record_field_read() {
    let bridge = bridge_with("c", counter("hits", 3));
    bridge.load_and_run("return c.name, c.Count, c.ID", "").unwrap();
    assert_eq!(bridge.read_as::<String>(1).unwrap(), "hits");
    assert_eq!(bridge.read_as::<i64>(2).unwrap(), 3);
    assert_eq!(bridge.read_as::<i64>(3).unwrap(), 1);
}

#[test]
fn test_record_write_through_shared() {
    let shared = Shared::new(counter("hits", 3));
    let bridge = bridge_with("x", shared.clone());
    bridge
        .load_and_run("x.Count = x.Count + 1 return x.Count", "")
        .unwrap();
    assert_eq!(bridge.read_as::<i64>(-1).unwrap(), 4);
    assert_eq!(shared.lock().count, 4);
}

#[test]
fn test_record_by_value_is_a_copy() {
    let original = counter("hits", 3);
    let bridge = bridge_with("x", original);
    bridge.load_and_run("x.count = 10 return x.count", "").unwrap();
    assert_eq!(bridge.read_as::<i64>(-1).unwrap(), 10);
}

#[test]
fn test_unknown_member_read_fails() {
    let bridge = bridge_with("c", counter("hits", 3));
    let message = run_err(&bridge, "return c.missing");
    assert!(message.contains("missing"), "{message}");

    bridge
        .load_and_run("local ok = pcall(function() return c.missing end) return ok", "")
        .unwrap();
    assert!(!bridge.engine().to_bool(-1));
}

#[test]
fn test_permissive_writes_are_ignored() {
    let shared = Shared::new(counter("hits", 3));
    let bridge = bridge_with("c", shared.clone());
    bridge.load_and_run("c.missing = 1 c.id = 99", "").unwrap();
    assert_eq!(shared.lock().id, 1);
}

#[test]
fn test_strict_writes_fail() {
    let bridge = Bridge::with_options(BridgeOptions::default().with_strict_writes(true)).unwrap();
    bridge.push_value(counter("hits", 3)).unwrap();
    bridge.engine().set_global("c").unwrap();

    let message = run_err(&bridge, "c.id = 99");
    assert!(message.contains("read-only"), "{message}");
    let message = run_err(&bridge, "c.missing = 1");
    assert!(message.contains("missing"), "{message}");
}

#[test]
fn test_write_type_mismatch() {
    let bridge = bridge_with("c", counter("hits", 3));
    let message = run_err(&bridge, "c.count = 'lots'");
    assert!(message.contains("type mismatch"), "{message}");
}

#[test]
fn test_record_length_and_pairs() {
    let bridge = bridge_with("c", counter("hits", 3));
    bridge
        .load_and_run(
            r#"
            local parts = {}
            for k, v in pairs(c) do
                parts[#parts + 1] = k .. "=" .. tostring(v)
            end
            return #c, table.concat(parts, ",")
            "#,
            "",
        )
        .unwrap();
    assert_eq!(bridge.read_as::<i64>(1).unwrap(), 3);
    assert_eq!(bridge.read_as::<String>(2).unwrap(), "name=hits,count=3,id=1");
}

#[test]
fn test_flattened_record_access() {
    let shared = Shared::new(Hero {
        stats: Stats { hp: 10 },
        name: "ada".to_string(),
    });
    let bridge = bridge_with("h", shared.clone());
    bridge
        .load_and_run("h.hp = h.hp + 5 return h.hp, h:heal(1), #h", "")
        .unwrap();
    assert_eq!(bridge.read_as::<i64>(1).unwrap(), 15);
    assert_eq!(bridge.read_as::<i64>(2).unwrap(), 16);
    assert_eq!(bridge.read_as::<i64>(3).unwrap(), 2);
    assert_eq!(shared.lock().stats.hp, 16);
}

// ==================== Methods ====================

#[test]
fn test_method_call_styles() {
    let shared = Shared::new(counter("hits", 0));
    let bridge = bridge_with("c", shared.clone());
    bridge
        .load_and_run("c:add(2) c.add(3) return c:label(), c:addPair(1, 1)", "")
        .unwrap();
    assert_eq!(bridge.read_as::<String>(1).unwrap(), "hits=5");
    assert_eq!(bridge.read_as::<i64>(2).unwrap(), 7);
    assert_eq!(shared.lock().count, 7);
}

#[test]
fn test_method_arity_mismatch() {
    let bridge = bridge_with("c", counter("hits", 0));
    let message = run_err(&bridge, "return c.add_pair(1)");
    assert!(message.contains("add_pair"), "{message}");
    assert!(message.contains("expected 2, got 1"), "{message}");
}

#[test]
fn test_colon_call_arity_mismatch() {
    let bridge = bridge_with("c", counter("hits", 0));
    let message = run_err(&bridge, "return c:add_pair(1)");
    assert!(message.contains("add_pair"), "{message}");
    assert!(message.contains("expected 2, got 1"), "{message}");

    let message = run_err(&bridge, "return c:add()");
    assert!(message.contains("expected 1, got 0"), "{message}");
}

#[test]
fn test_runtime_error_keeps_bridge_cause() {
    let bridge = bridge_with("c", counter("hits", 0));
    let err = bridge.load_and_run("return c:add_pair(1)", "").unwrap_err();
    assert!(matches!(
        err.cause(),
        Some(BridgeError::ArityMismatch { expected: 2, supplied: 1, .. })
    ));

    let err = bridge.load_and_run("error('plain')", "").unwrap_err();
    assert!(err.cause().is_none());
}

#[test]
fn test_extra_arguments_are_dropped() {
    let bridge = bridge_with("c", counter("hits", 0));
    bridge.load_and_run("return c.add(4, 100, 'x')", "").unwrap();
    assert_eq!(bridge.read_as::<i64>(-1).unwrap(), 4);
}

#[test]
fn test_method_argument_type_error() {
    let bridge = bridge_with("c", counter("hits", 0));
    let message = run_err(&bridge, "return c:add('many')");
    assert!(message.contains("argument #1"), "{message}");
}

#[test]
fn test_method_error_result() {
    let bridge = bridge_with("c", counter("hits", 8));
    bridge.load_and_run("return c:checked(10)", "").unwrap();
    assert_eq!(bridge.read_as::<i64>(-1).unwrap(), 2);

    let message = run_err(&bridge, "return c:checked(5)");
    assert!(message.contains("8 exceeds 5"), "{message}");
}

#[test]
fn test_method_invoker_is_single_use() {
    let bridge = bridge_with("c", counter("hits", 0));
    let message = run_err(&bridge, "local f = c.add f(1) return f(1)");
    assert!(message.contains("stale"), "{message}");
}

#[test]
fn test_method_invokers_are_released() {
    let bridge = bridge_with("c", counter("hits", 0));
    let before = bridge.registry().len();
    bridge
        .load_and_run("for i = 1, 10 do c:add(i) end return c.count", "")
        .unwrap();
    assert_eq!(bridge.read_as::<i64>(-1).unwrap(), 55);
    bridge.engine().set_top(0);
    bridge.engine().gc_collect().unwrap();
    assert_eq!(bridge.registry().len(), before);
}

#[test]
fn test_record_argument_by_reference() {
    let a = Shared::new(counter("a", 1));
    let b = Shared::new(counter("b", 5));
    let bridge = bridge_with("a", a.clone());
    bridge.push_value(b.clone()).unwrap();
    bridge.engine().set_global("b").unwrap();

    bridge.load_and_run("return a:absorb(b)", "").unwrap();
    assert_eq!(bridge.read_as::<i64>(-1).unwrap(), 6);
    assert_eq!(a.lock().count, 6);
    assert_eq!(b.lock().count, 5);
}

#[test]
fn test_receiver_as_argument_fails() {
    let bridge = bridge_with("a", Shared::new(counter("a", 1)));
    let message = run_err(&bridge, "return a:absorb(a)");
    assert!(message.contains("own method"), "{message}");
}

// ==================== Nested composites ====================

#[test]
fn test_nested_collection_writes_reach_owner() {
    let shared = Shared::new(bag());
    let bridge = bridge_with("x", shared.clone());
    bridge
        .load_and_run("x.tags.a = 7 x.items[1] = 99 return x.tags.a, x.items[1], #x.items", "")
        .unwrap();
    assert_eq!(bridge.read_as::<i64>(1).unwrap(), 7);
    assert_eq!(bridge.read_as::<i64>(2).unwrap(), 99);
    assert_eq!(bridge.read_as::<i64>(3).unwrap(), 2);

    let bag = shared.lock();
    assert_eq!(bag.tags.get("a"), Some(&7));
    assert_eq!(bag.items, vec![99, 2]);
}

#[test]
fn test_nested_record_writes_reach_owner() {
    let shared = Shared::new(bag());
    let bridge = bridge_with("x", shared.clone());
    bridge
        .load_and_run("x.spot.x = 5 local s = x.spot s.y = 6 return x.spot.x + x.spot.y", "")
        .unwrap();
    assert_eq!(bridge.read_as::<i64>(-1).unwrap(), 11);
    let bag = shared.lock();
    assert_eq!((bag.spot.x, bag.spot.y), (5, 6));
}

#[test]
fn test_nested_handle_into_by_value_owner() {
    // a handle into a by-value owner edits the bridge's copy
    let bridge = bridge_with("x", bag());
    bridge
        .load_and_run("local items = x.items items[2] = 20 return x.items[2]", "")
        .unwrap();
    assert_eq!(bridge.read_as::<i64>(-1).unwrap(), 20);
}

#[test]
fn test_nested_handles_compare_by_location() {
    let bridge = bridge_with("x", Shared::new(bag()));
    bridge
        .load_and_run("return x.items == x.items, x.items == x.tags, x.spot == x.spot", "")
        .unwrap();
    assert!(bridge.engine().to_bool(1));
    assert!(!bridge.engine().to_bool(2));
    assert!(bridge.engine().to_bool(3));
}

#[test]
fn test_record_assigned_and_passed_by_value() {
    let shared = Shared::new(bag());
    let bridge = bridge_with("x", shared.clone());
    bridge.push_value(Spot { x: 1, y: 2 }).unwrap();
    bridge.engine().set_global("p").unwrap();

    bridge
        .load_and_run("x.spot = p p.x = 50 local before = x.spot.x return before, x:place(p)", "")
        .unwrap();
    assert_eq!(bridge.read_as::<i64>(1).unwrap(), 1);
    assert_eq!(bridge.read_as::<i64>(2).unwrap(), 52);
    assert_eq!(shared.lock().spot.x, 50);
}

#[test]
fn test_nested_field_passed_to_method_is_a_copy() {
    let shared = Shared::new(bag());
    let bridge = bridge_with("x", shared.clone());
    bridge
        .load_and_run("x.spot.x = 3 x.spot.y = 4 return x:place(x.spot)", "")
        .unwrap();
    assert_eq!(bridge.read_as::<i64>(-1).unwrap(), 7);
    assert_eq!((shared.lock().spot.x, shared.lock().spot.y), (3, 4));
}

// ==================== Sequences ====================

#[test]
fn test_sequence_read_and_length() {
    let bridge = bridge_with("s", vec![10i64, 20, 30]);
    bridge
        .load_and_run("return #s, s[1], s[3], s[0], s[4], s.x", "")
        .unwrap();
    assert_eq!(bridge.read_as::<i64>(1).unwrap(), 3);
    assert_eq!(bridge.read_as::<i64>(2).unwrap(), 10);
    assert_eq!(bridge.read_as::<i64>(3).unwrap(), 30);
    assert!(bridge.engine().is_nil(4));
    assert!(bridge.engine().is_nil(5));
    assert!(bridge.engine().is_nil(6));
}

#[test]
fn test_sequence_write() {
    let shared = Shared::new(vec![10i64, 20, 30]);
    let bridge = bridge_with("s", shared.clone());
    bridge.load_and_run("s[2] = 99 s[3] = 2.0", "").unwrap();
    assert_eq!(*shared.lock(), vec![10, 99, 2]);
}

#[test]
fn test_sequence_write_out_of_range() {
    let shared = Shared::new(vec![10i64, 20, 30]);
    let bridge = bridge_with("s", shared.clone());
    let message = run_err(&bridge, "s[4] = 1");
    assert!(message.contains("out of range"), "{message}");
    let message = run_err(&bridge, "s[0] = 1");
    assert!(message.contains("out of range"), "{message}");
    assert_eq!(shared.lock().len(), 3);
}

#[test]
fn test_ipairs_over_sequence() {
    let bridge = bridge_with("s", vec![10i64, 20, 30]);
    bridge
        .load_and_run(
            r#"
            local sum, last = 0, 0
            for i, v in ipairs(s) do
                sum = sum + v
                last = i
            end
            return sum, last
            "#,
            "",
        )
        .unwrap();
    assert_eq!(bridge.read_as::<i64>(1).unwrap(), 60);
    assert_eq!(bridge.read_as::<i64>(2).unwrap(), 3);
}

#[test]
fn test_ipairs_still_works_on_tables() {
    let bridge = Bridge::new(true).unwrap();
    bridge
        .load_and_run(
            "local n = 0 for _, v in ipairs({ 4, 5, 6 }) do n = n + v end return n",
            "",
        )
        .unwrap();
    assert_eq!(bridge.read_as::<i64>(-1).unwrap(), 15);
}

#[test]
fn test_ipairs_over_map_counts_entries() {
    let mut map = HashMap::new();
    map.insert("a".to_string(), 1i64);
    map.insert("b".to_string(), 2i64);
    let bridge = bridge_with("m", map);
    bridge
        .load_and_run(
            "local keys, total = {}, 0 for i, v in ipairs(m) do keys[#keys + 1] = i total = total + v end return table.concat(keys, ','), total",
            "",
        )
        .unwrap();
    assert_eq!(bridge.read_as::<String>(1).unwrap(), "1,2");
    assert_eq!(bridge.read_as::<i64>(2).unwrap(), 3);
}

// ==================== Mappings ====================

#[test]
fn test_map_read_write_delete() {
    let mut map = HashMap::new();
    map.insert("fig".to_string(), 1i64);
    let shared = Shared::new(map);
    let bridge = bridge_with("m", shared.clone());

    bridge
        .load_and_run(
            r#"
            m.apple = 5
            m["pear"] = 7
            local n = #m
            m.apple = nil
            return m.pear, n, #m, m.apple, m.missing
            "#,
            "",
        )
        .unwrap();
    assert_eq!(bridge.read_as::<i64>(1).unwrap(), 7);
    assert_eq!(bridge.read_as::<i64>(2).unwrap(), 3);
    assert_eq!(bridge.read_as::<i64>(3).unwrap(), 2);
    assert!(bridge.engine().is_nil(4));
    assert!(bridge.engine().is_nil(5));

    let map = shared.lock();
    assert_eq!(map.len(), 2);
    assert_eq!(map.get("pear"), Some(&7));
    assert!(!map.contains_key("apple"));
}

#[test]
fn test_nil_removes_optional_map_entry() {
    let shared = Shared::new(bag());
    let bridge = bridge_with("x", shared.clone());
    bridge
        .load_and_run("local before = #x.notes x.notes.kept = nil x.notes.empty = nil return before, #x.notes", "")
        .unwrap();
    assert_eq!(bridge.read_as::<i64>(1).unwrap(), 2);
    assert_eq!(bridge.read_as::<i64>(2).unwrap(), 0);
    assert!(shared.lock().notes.is_empty());
}

#[test]
fn test_map_with_integer_keys() {
    let mut map: HashMap<i64, String> = HashMap::new();
    map.insert(1, "one".to_string());
    let bridge = bridge_with("m", map);
    bridge.load_and_run("return m[1], m['x']", "").unwrap();
    assert_eq!(bridge.read_as::<String>(1).unwrap(), "one");
    assert!(bridge.engine().is_nil(2));
}

#[test]
fn test_pairs_over_map() {
    let mut map = HashMap::new();
    map.insert("a".to_string(), 1i64);
    map.insert("b".to_string(), 2i64);
    map.insert("c".to_string(), 3i64);
    let bridge = bridge_with("m", map);
    bridge
        .load_and_run(
            r#"
            local seen, total = {}, 0
            for k, v in pairs(m) do
                seen[k] = v
                total = total + v
            end
            return seen.a, seen.b, seen.c, total
            "#,
            "",
        )
        .unwrap();
    assert_eq!(bridge.read_as::<i64>(1).unwrap(), 1);
    assert_eq!(bridge.read_as::<i64>(2).unwrap(), 2);
    assert_eq!(bridge.read_as::<i64>(3).unwrap(), 3);
    assert_eq!(bridge.read_as::<i64>(4).unwrap(), 6);
}

#[test]
fn test_pairs_skips_entries_deleted_during_loop() {
    let mut map = HashMap::new();
    for (i, key) in ["a", "b", "c", "d"].into_iter().enumerate() {
        map.insert(key.to_string(), i as i64);
    }
    let bridge = bridge_with("m", map);
    bridge
        .load_and_run(
            r#"
            local visited = 0
            for k in pairs(m) do
                visited = visited + 1
                for other in pairs({ a = 1, b = 1, c = 1, d = 1 }) do
                    if other ~= k then m[other] = nil end
                end
            end
            return visited, #m
            "#,
            "",
        )
        .unwrap();
    assert_eq!(bridge.read_as::<i64>(1).unwrap(), 1);
    assert_eq!(bridge.read_as::<i64>(2).unwrap(), 1);
}

// ==================== Metamethods ====================

#[test]
fn test_tostring() {
    let bridge = Bridge::new(true).unwrap();
    bridge.push_value(counter("hits", 0)).unwrap();
    let id = bridge.engine().to_foreign_handle_id(-1).unwrap();
    bridge.engine().set_global("c").unwrap();

    bridge.load_and_run("return tostring(c)", "").unwrap();
    assert_eq!(bridge.read_as::<String>(-1).unwrap(), format!("Counter({id})"));
}

#[test]
fn test_equality_is_identity() {
    let shared = Shared::new(counter("a", 0));
    let bridge = bridge_with("a", shared.clone());
    bridge.push_value(shared.clone()).unwrap();
    bridge.engine().set_global("b").unwrap();
    bridge.push_value(Shared::new(counter("a", 0))).unwrap();
    bridge.engine().set_global("c").unwrap();

    bridge.load_and_run("return a == b, a == c, a == a, a ~= c", "").unwrap();
    assert!(bridge.engine().to_bool(1));
    assert!(!bridge.engine().to_bool(2));
    assert!(bridge.engine().to_bool(3));
    assert!(bridge.engine().to_bool(4));
}

#[test]
fn test_records_are_not_callable() {
    let bridge = bridge_with("c", counter("hits", 0));
    let message = run_err(&bridge, "c()");
    assert!(message.contains("attempt to call"), "{message}");
}

#[test]
fn test_handle_type_from_script() {
    let bridge = bridge_with("c", counter("hits", 0));
    bridge.load_and_run("return type(c)", "").unwrap();
    assert_eq!(bridge.read_as::<String>(-1).unwrap(), "userdata");
}
