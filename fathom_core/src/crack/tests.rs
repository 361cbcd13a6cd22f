use super::*;
use crate::bits::PullFn;
use crate::encoding::StringEncoding;
use crate::model::Relation;
use crate::schema::ElementDef;
use std::collections::VecDeque;

fn build(model: ElementDef) -> Schema {
    Schema::build(vec![model]).unwrap()
}

fn crack(schema: &Schema, model: &str, data: &[u8]) -> Result<Tree, CrackError> {
    Cracker::default().crack_bytes(schema, model, data)
}

fn value_at(tree: &Tree, path: &str) -> Value {
    let id = tree
        .find(path)
        .unwrap_or_else(|| panic!("'{path}' is not in the cracked tree"));
    tree.value(id).cloned().unwrap_or_else(|| panic!("'{path}' has no value"))
}

fn bytes(data: &[u8]) -> Value {
    Value::Bits(BitBuf::from_bytes(data))
}

fn packet() -> Schema {
    build(
        ElementDef::block("Packet")
            .child(ElementDef::number("magic", 8).value(0x50).token())
            .child(ElementDef::number("count", 8).relation(Relation::count_of("record")))
            .child(
                ElementDef::block("record")
                    .child(ElementDef::number("kind", 8))
                    .child(ElementDef::number("len", 8).relation(Relation::size_of("payload")))
                    .child(ElementDef::blob("payload"))
                    .min_occurs(0),
            ),
    )
}

const PACKET: [u8; 9] = [0x50, 2, 1, 2, 0xaa, 0xbb, 2, 1, 0xcc];

#[test]
fn fixed_blob_then_remainder() {
    let schema = build(
        ElementDef::block("M")
            .child(ElementDef::blob("data").length(5))
            .child(ElementDef::blob("rest")),
    );
    let tree = crack(&schema, "M", &[1, 2, 3, 4, 5, 6, 0xff, 0xfe, 0xff]).unwrap();
    assert_eq!(value_at(&tree, "M.data"), bytes(&[1, 2, 3, 4, 5]));
    assert_eq!(value_at(&tree, "M.rest"), bytes(&[6, 0xff, 0xfe, 0xff]));
    assert_eq!(tree.span(tree.find("M.data").unwrap()), Some((0, 40)));
}

#[test]
fn constraint_rejects_first_alternative() {
    let schema = build(
        ElementDef::block("M").child(
            ElementDef::choice("pick")
                .child(ElementDef::blob("a").length(5).constraint("len(value) < 3"))
                .child(ElementDef::blob("b").length(5)),
        ),
    );
    let tree = crack(&schema, "M", &[1, 2, 3, 4, 5]).unwrap();
    let pick = tree.find("M.pick").unwrap();
    let selected = tree.selected(pick).expect("an alternative must be selected");
    assert_eq!(tree.name(selected), "b");
    assert_eq!(value_at(&tree, "M.pick.b"), bytes(&[1, 2, 3, 4, 5]));
}

#[test]
fn count_relation_drives_entries() {
    let schema = build(
        ElementDef::block("M")
            .child(ElementDef::number("count", 8).relation(Relation::count_of("items")))
            .child(ElementDef::number("items", 8).min_occurs(0)),
    );
    let mut cursor = BitCursor::new(vec![5, 1, 2, 3, 4, 5, 9]);
    let tree = Cracker::default().crack(&schema, "M", &mut cursor).unwrap();
    let items = tree.find("M.items").unwrap();
    let values: Vec<Value> = tree
        .entries(items)
        .iter()
        .filter_map(|id| tree.value(*id).cloned())
        .collect();
    assert_eq!(values, (1..=5).map(Value::UInt).collect::<Vec<_>>());
    assert_eq!(cursor.position(), 48, "the trailing byte is left unread");
    assert_eq!(tree.name(tree.entries(items)[2]), "items_2");
}

#[test]
fn optional_token_array_stops_at_following_token() {
    let schema = build(
        ElementDef::block("M")
            .child(ElementDef::string("A"))
            .child(ElementDef::string("T1").value(" ").token())
            .child(ElementDef::string("B"))
            .child(ElementDef::string("T2").value("-").token().min_occurs(0))
            .child(ElementDef::string("T3").value(" ").token())
            .child(ElementDef::string("C")),
    );
    let tree = crack(&schema, "M", b"aaa bbb-------------- ccc").unwrap();
    assert_eq!(value_at(&tree, "M.A"), Value::Str("aaa".into()));
    assert_eq!(value_at(&tree, "M.B"), Value::Str("bbb".into()));
    assert_eq!(value_at(&tree, "M.C"), Value::Str("ccc".into()));
    let dashes = tree.find("M.T2").unwrap();
    assert_eq!(tree.entries(dashes).len(), 14);
}

#[test]
fn empty_block_sized_by_relation_consumes_its_length() {
    let schema = build(
        ElementDef::block("M")
            .child(ElementDef::number("len", 8).relation(Relation::size_of("blk")))
            .child(ElementDef::block("blk")),
    );
    let mut cursor = BitCursor::new(vec![2, 0, 0]);
    let tree = Cracker::default().crack(&schema, "M", &mut cursor).unwrap();
    assert_eq!(cursor.position(), 24);
    assert_eq!(tree.span(tree.find("M.blk").unwrap()), Some((8, 24)));
}

#[test]
fn self_sized_block_bounds_its_last_child() {
    let schema = build(
        ElementDef::block("M").child(
            ElementDef::block("blk")
                .child(ElementDef::number("len", 8).relation(Relation::size_of("blk")))
                .child(ElementDef::blob("body")),
        ),
    );
    let tree = crack(&schema, "M", &[3, 0xaa, 0xbb, 0xcc]).unwrap();
    assert_eq!(value_at(&tree, "M.blk.body"), bytes(&[0xaa, 0xbb]));
    assert_eq!(tree.generate_bytes().unwrap(), vec![3, 0xaa, 0xbb]);
}

#[test]
fn self_sized_block_reports_overread() {
    let schema = build(
        ElementDef::block("M").child(
            ElementDef::block("blk")
                .child(
                    ElementDef::number("len", 32)
                        .big_endian()
                        .relation(Relation::size_of("blk")),
                )
                .child(ElementDef::blob("body")),
        ),
    );
    let err = crack(&schema, "M", &[0, 0, 0, 2, 0xaa]).unwrap_err();
    assert!(matches!(err, CrackError::Overread(_)), "{err}");
    assert_eq!(err.element(), Some("M.blk"));
    assert!(
        err.to_string().contains("Length is 16 bits but already read 32 bits."),
        "{err}"
    );
}

#[test]
fn placement_moves_element_and_rewrites_relation() {
    let schema = build(
        ElementDef::block("M")
            .child(ElementDef::number("len", 8).relation(Relation::size_of("Data")))
            .child(ElementDef::block("Marker").child(ElementDef::blob("x").length(1)))
            .child(ElementDef::blob("Data").before("Marker")),
    );
    let tree = crack(&schema, "M", &[2, 0x11, 0xaa, 0xbb]).unwrap();
    let names: Vec<&str> = tree
        .children(tree.root())
        .iter()
        .map(|id| tree.name(*id))
        .collect();
    assert_eq!(names, vec!["len", "Data", "Marker"]);
    assert_eq!(tree.relations(tree.find("M.len").unwrap())[0].of, "M.Data");
    assert_eq!(tree.generate_bytes().unwrap(), vec![2, 0xaa, 0xbb, 0x11]);
}

#[test]
fn placement_renames_on_collision() {
    let schema = build(
        ElementDef::block("TheDataModel")
            .child(ElementDef::number("Length", 8).relation(Relation::size_of("Block1.Data")))
            .child(ElementDef::block("Block1").child(ElementDef::blob("Data").after("Block1")))
            .child(ElementDef::blob("Data").length(1)),
    );
    let tree = crack(&schema, "TheDataModel", &[2, 0xaa, 0xbb, 0xcc]).unwrap();
    let names: Vec<&str> = tree
        .children(tree.root())
        .iter()
        .map(|id| tree.name(*id))
        .collect();
    assert_eq!(names, vec!["Length", "Block1", "Data_1", "Data"]);
    assert_eq!(value_at(&tree, "TheDataModel.Data_1"), bytes(&[0xaa, 0xbb]));
    assert_eq!(
        tree.relations(tree.find("TheDataModel.Length").unwrap())[0].of,
        "TheDataModel.Data_1"
    );
    assert_eq!(tree.generate_bytes().unwrap(), vec![2, 0xaa, 0xbb, 0xcc]);
}

#[test]
fn expression_errors_are_not_swallowed_by_choice() {
    let schema = build(
        ElementDef::block("M").child(
            ElementDef::choice("pick")
                .child(ElementDef::number("broken", 8).constraint("value / 0 == 1"))
                .child(ElementDef::number("fine", 8)),
        ),
    );
    let err = crack(&schema, "M", &[1]).unwrap_err();
    assert!(matches!(err, CrackError::Expression { .. }), "{err}");
    assert!(!err.is_recoverable());
    assert_eq!(err.element(), Some("M.pick.broken"));
}

#[test]
fn no_matching_alternative_is_a_mismatch() {
    let schema = build(
        ElementDef::block("M").child(
            ElementDef::choice("pick")
                .child(ElementDef::number("one", 8).value(1).token())
                .child(ElementDef::number("two", 8).value(2).token()),
        ),
    );
    let err = crack(&schema, "M", &[3]).unwrap_err();
    assert!(matches!(err, CrackError::StructuralMismatch(_)), "{err}");
    assert_eq!(
        err.to_string(),
        "Choice 'M.pick' failed to crack. No valid children were found."
    );
}

fn selected(tree: &Tree, choice: &str) -> String {
    let id = tree.find(choice).unwrap();
    tree.name(tree.selected(id).unwrap()).to_string()
}

#[test]
fn repeated_input_hits_the_choice_cache() {
    let schema = build(
        ElementDef::block("M").child(
            ElementDef::choice("pick")
                .child(ElementDef::number("one", 8).value(1).token())
                .child(ElementDef::number("two", 8).value(2).token()),
        ),
    );
    let mut cracker = Cracker::default();

    let first = cracker.crack_bytes(&schema, "M", &[1]).unwrap();
    assert_eq!(selected(&first, "M.pick"), "one");
    assert_eq!((cracker.cache().hits(), cracker.cache().misses()), (0, 1));

    let second = cracker.crack_bytes(&schema, "M", &[2]).unwrap();
    assert_eq!(selected(&second, "M.pick"), "two");
    assert_eq!((cracker.cache().hits(), cracker.cache().misses()), (0, 2));

    let third = cracker.crack_bytes(&schema, "M", &[2]).unwrap();
    assert_eq!(selected(&third, "M.pick"), "two");
    assert_eq!(cracker.cache().hits(), 1);
    assert_eq!(cracker.cache().len(), 2);
}

#[test]
fn cache_history_does_not_change_the_choice() {
    let schema = build(
        ElementDef::block("M").child(
            ElementDef::choice("pick")
                .child(
                    ElementDef::block("long")
                        .child(ElementDef::number("tag", 8).value(1).token())
                        .child(ElementDef::blob("body").length(10)),
                )
                .child(ElementDef::blob("short").length(1)),
        ),
    );
    let mut long_input = vec![0u8; 11];
    long_input[0] = 1;
    let fresh = Cracker::default().crack_bytes(&schema, "M", &long_input).unwrap();
    assert_eq!(selected(&fresh, "M.pick"), "long");

    // Same first eight bytes, but too short for the long alternative.
    let mut cracker = Cracker::default();
    let warm = cracker.crack_bytes(&schema, "M", &long_input[..8]).unwrap();
    assert_eq!(selected(&warm, "M.pick"), "short");
    assert!(
        cracker.cache().is_empty(),
        "a search that read past the window is not cached"
    );
    let after = cracker.crack_bytes(&schema, "M", &long_input).unwrap();
    assert_eq!(selected(&after, "M.pick"), "long");
    assert_eq!(after.view(), fresh.view());
}

#[test]
fn pending_relations_are_part_of_the_cache_key() {
    let schema = build(
        ElementDef::block("M")
            .child(ElementDef::number("len", 8).relation(Relation::size_of("a")))
            .child(
                ElementDef::choice("pick")
                    .child(ElementDef::blob("a").constraint("len(value) == 2"))
                    .child(ElementDef::blob("b").length(1)),
            )
            .child(ElementDef::blob("rest")),
    );
    let mut cracker = Cracker::default();
    let one = cracker.crack_bytes(&schema, "M", &[1, 0xaa, 0xbb, 0xcc]).unwrap();
    assert_eq!(selected(&one, "M.pick"), "b");
    assert_eq!(cracker.cache().len(), 1);

    // Same upcoming bytes, different length prefix.
    let two = cracker.crack_bytes(&schema, "M", &[2, 0xaa, 0xbb, 0xcc]).unwrap();
    assert_eq!(selected(&two, "M.pick"), "a");
    assert_eq!(value_at(&two, "M.pick.a"), bytes(&[0xaa, 0xbb]));
    assert_eq!(value_at(&two, "M.rest"), bytes(&[0xcc]));
}

#[test]
fn disabled_cache_records_nothing() {
    let mut cracker = Cracker::new(CrackerSettings {
        choice_cache: false,
        ..CrackerSettings::default()
    });
    let schema = build(
        ElementDef::block("M").child(
            ElementDef::choice("pick")
                .child(ElementDef::number("one", 8).value(1).token())
                .child(ElementDef::number("two", 8).value(2).token()),
        ),
    );
    cracker.crack_bytes(&schema, "M", &[2]).unwrap();
    assert!(cracker.cache().is_empty());
    assert_eq!(cracker.cache().misses(), 0);
}

#[test]
fn cracked_packet_generates_identical_bytes() {
    let tree = crack(&packet(), "Packet", &PACKET).unwrap();
    let records = tree.find("Packet.record").unwrap();
    assert_eq!(tree.entries(records).len(), 2);
    assert_eq!(value_at(&tree, "Packet.record.record_1.payload"), bytes(&[0xcc]));
    assert_eq!(tree.generate_bytes().unwrap(), PACKET.to_vec());
}

#[test]
fn cracking_is_deterministic() {
    let schema = packet();
    let mut cracker = Cracker::default();
    let first = cracker.crack_bytes(&schema, "Packet", &PACKET).unwrap();
    let second = cracker.crack_bytes(&schema, "Packet", &PACKET).unwrap();
    assert_eq!(first.view(), second.view());
}

#[test]
fn streaming_input_cracks_like_a_buffer() {
    let mut pending: VecDeque<u8> = PACKET.iter().copied().collect();
    let pull: PullFn = Box::new(move |_want| pending.pop_front().into_iter().collect());
    let mut cursor = BitCursor::streaming(Vec::new(), pull).with_chunk_size(1);
    let streamed = Cracker::default().crack(&packet(), "Packet", &mut cursor).unwrap();
    let buffered = crack(&packet(), "Packet", &PACKET).unwrap();
    assert_eq!(streamed.view(), buffered.view());
}

#[test]
fn count_above_maximum_is_rejected() {
    let schema = build(
        ElementDef::block("M")
            .child(ElementDef::number("count", 8).relation(Relation::count_of("items")))
            .child(ElementDef::number("items", 8).min_occurs(0).max_occurs(2)),
    );
    let err = crack(&schema, "M", &[3, 1, 2, 3]).unwrap_err();
    assert!(matches!(err, CrackError::StructuralMismatch(_)), "{err}");
    assert!(
        err.to_string().contains("Count of 3 is greater than the maximum of 2."),
        "{err}"
    );
}

#[test]
fn too_few_entries_reports_progress() {
    let schema = build(ElementDef::block("M").child(ElementDef::number("items", 16).min_occurs(2)));
    let err = crack(&schema, "M", &[1, 0, 2]).unwrap_err();
    assert!(matches!(err, CrackError::InsufficientData(_)), "{err}");
    assert!(err.to_string().contains("Only cracked 1 of 2 entries."), "{err}");
}

#[test]
fn offset_relation_seeks_forward() {
    let schema = build(
        ElementDef::block("M")
            .child(ElementDef::number("ptr", 8).relation(Relation::offset_of("body")))
            .child(ElementDef::blob("body").length(1)),
    );
    let tree = crack(&schema, "M", &[2, 0xff, 0x55]).unwrap();
    assert_eq!(value_at(&tree, "M.body"), bytes(&[0x55]));
    assert_eq!(tree.span(tree.find("M.body").unwrap()), Some((16, 24)));
}

#[test]
fn offset_behind_cursor_is_a_mismatch() {
    let schema = build(
        ElementDef::block("M")
            .child(ElementDef::number("ptr", 8).relation(Relation::offset_of("body")))
            .child(ElementDef::blob("body").length(1)),
    );
    let err = crack(&schema, "M", &[0, 0xff]).unwrap_err();
    assert!(matches!(err, CrackError::StructuralMismatch(_)), "{err}");
    assert!(err.to_string().contains("Offset is 0 bits but already read 8 bits."), "{err}");
}

#[test]
fn absolute_element_is_cracked_out_of_line() {
    let schema = build(
        ElementDef::block("M")
            .child(ElementDef::number("ptr", 8).relation(Relation::offset_of("tail")))
            .child(ElementDef::number("mid", 8))
            .child(ElementDef::number("tail", 8).absolute()),
    );
    let mut cursor = BitCursor::new(vec![3, 0x11, 0x99, 0x42]);
    let tree = Cracker::default().crack(&schema, "M", &mut cursor).unwrap();
    assert_eq!(value_at(&tree, "M.mid"), Value::UInt(0x11));
    assert_eq!(value_at(&tree, "M.tail"), Value::UInt(0x42));
    assert_eq!(cursor.position(), 16, "cracking resumes after the inline elements");
    assert_eq!(tree.relations(tree.find("M.ptr").unwrap())[0].of, "M.tail");
    assert_eq!(tree.generate_bytes().unwrap(), vec![2, 0x11, 0x42]);
}

#[test]
fn unsized_element_before_terminated_string_fails() {
    let schema = build(
        ElementDef::block("M")
            .child(ElementDef::blob("a"))
            .child(ElementDef::string("s").null_terminated()),
    );
    let err = crack(&schema, "M", b"abc\0").unwrap_err();
    assert!(matches!(err, CrackError::Unsized(_)), "{err}");
    assert_eq!(err.to_string(), "Blob 'M.a' failed to crack. Element is unsized.");
}

#[test]
fn missing_required_token_is_a_mismatch() {
    let schema = build(
        ElementDef::block("M")
            .child(ElementDef::string("a"))
            .child(ElementDef::string("end").value(";").token()),
    );
    let err = crack(&schema, "M", b"abc").unwrap_err();
    assert!(err.is_recoverable());
    assert!(err.to_string().contains("Missing required token 'M.end'."), "{err}");
}

#[test]
fn null_terminated_string_round_trips() {
    let schema = build(
        ElementDef::block("M")
            .child(ElementDef::string("s").null_terminated())
            .child(ElementDef::number("n", 8)),
    );
    let tree = crack(&schema, "M", b"hi\0\x07").unwrap();
    assert_eq!(value_at(&tree, "M.s"), Value::Str("hi".into()));
    assert_eq!(value_at(&tree, "M.n"), Value::UInt(7));
    assert_eq!(tree.generate_bytes().unwrap(), b"hi\0\x07".to_vec());
}

#[test]
fn character_counts_follow_the_encoding() {
    let schema = build(
        ElementDef::block("M").child(
            ElementDef::string("s")
                .encoding(StringEncoding::Utf16Le)
                .length_chars(2),
        ),
    );
    let tree = crack(&schema, "M", b"a\0b\0").unwrap();
    assert_eq!(value_at(&tree, "M.s"), Value::Str("ab".into()));
}

#[test]
fn numbers_honor_width_and_byte_order() {
    let schema = build(
        ElementDef::block("M")
            .child(ElementDef::number("le", 16))
            .child(ElementDef::number("be", 16).big_endian())
            .child(ElementDef::number("hi", 4))
            .child(ElementDef::number("lo", 4))
            .child(ElementDef::number("neg", 8).signed()),
    );
    let tree = crack(&schema, "M", &[0x01, 0x02, 0x01, 0x02, 0xab, 0xff]).unwrap();
    assert_eq!(value_at(&tree, "M.le"), Value::UInt(0x0201));
    assert_eq!(value_at(&tree, "M.be"), Value::UInt(0x0102));
    assert_eq!(value_at(&tree, "M.hi"), Value::UInt(0xa));
    assert_eq!(value_at(&tree, "M.lo"), Value::UInt(0xb));
    assert_eq!(value_at(&tree, "M.neg"), Value::Int(-1));
}

#[test]
fn failed_alternative_leaves_no_bindings_behind() {
    let schema = build(
        ElementDef::block("M")
            .child(
                ElementDef::choice("head")
                    .child(
                        ElementDef::block("long")
                            .child(ElementDef::number("len", 8).relation(Relation::size_of("body")))
                            .child(ElementDef::number("marker", 8).value(0x99).token()),
                    )
                    .child(ElementDef::block("short").child(ElementDef::number("tag", 8))),
            )
            .child(ElementDef::blob("body")),
    );
    let tree = crack(&schema, "M", &[1, 0xaa, 0xbb]).unwrap();
    assert_eq!(value_at(&tree, "M.head.short.tag"), Value::UInt(1));
    assert_eq!(
        value_at(&tree, "M.body"),
        bytes(&[0xaa, 0xbb]),
        "the rolled-back size relation must not size the body"
    );
}

#[test]
fn child_overreading_a_sized_block_is_fatal() {
    let schema = build(
        ElementDef::block("M")
            .child(ElementDef::number("len", 8).relation(Relation::size_of("blk")))
            .child(ElementDef::block("blk").child(ElementDef::number("n", 32))),
    );
    let err = crack(&schema, "M", &[2, 0, 0, 0, 0]).unwrap_err();
    assert!(matches!(err, CrackError::Overread(_)), "{err}");
    assert!(!err.is_recoverable());
    assert_eq!(
        err.to_string(),
        "Block 'M.blk' failed to crack. Length is 16 bits but already read 32 bits."
    );
}

#[test]
fn sized_block_with_children_does_not_skip_its_remainder() {
    let schema = build(
        ElementDef::block("M")
            .child(ElementDef::number("len", 8).relation(Relation::size_of("blk")))
            .child(ElementDef::block("blk").child(ElementDef::number("n", 8))),
    );
    let err = crack(&schema, "M", &[3, 1, 2, 3]).unwrap_err();
    assert!(matches!(err, CrackError::StructuralMismatch(_)), "{err}");
    assert_eq!(
        err.to_string(),
        "Block 'M.blk' failed to crack. Length is 24 bits but only read 8 bits."
    );
}

#[test]
fn overread_inside_an_alternative_aborts_the_choice() {
    let schema = build(
        ElementDef::block("M").child(
            ElementDef::choice("pick")
                .child(
                    ElementDef::block("a")
                        .child(ElementDef::number("len", 8).relation(Relation::size_of("body")))
                        .child(ElementDef::block("body").child(ElementDef::number("n", 32))),
                )
                .child(ElementDef::blob("b").length(1)),
        ),
    );
    let err = crack(&schema, "M", &[2, 0, 0, 0, 0, 0]).unwrap_err();
    assert!(matches!(err, CrackError::Overread(_)), "{err}");
    assert_eq!(err.element(), Some("M.pick.a.body"));
}

#[test]
fn choice_slot_rejects_alternatives_that_do_not_fit() {
    let schema = build(
        ElementDef::block("M")
            .child(ElementDef::number("len", 8).relation(Relation::size_of("pick")))
            .child(
                ElementDef::choice("pick")
                    .child(ElementDef::number("wide", 16))
                    .child(ElementDef::number("narrow", 8)),
            ),
    );
    let tree = crack(&schema, "M", &[1, 0xaa, 0xbb]).unwrap();
    assert_eq!(selected(&tree, "M.pick"), "narrow");
    assert_eq!(value_at(&tree, "M.pick.narrow"), Value::UInt(0xaa));
}

#[test]
fn array_stops_at_max_occurs_with_data_left() {
    let schema = build(
        ElementDef::block("M")
            .child(ElementDef::number("items", 8).min_occurs(0).max_occurs(2))
            .child(ElementDef::blob("rest")),
    );
    let tree = crack(&schema, "M", &[1, 2, 3, 4]).unwrap();
    let items = tree.find("M.items").unwrap();
    assert_eq!(tree.entries(items).len(), 2);
    assert_eq!(value_at(&tree, "M.rest"), bytes(&[3, 4]));
}

#[test]
fn soft_stopped_array_is_undone_with_its_alternative() {
    let schema = build(
        ElementDef::block("M").child(
            ElementDef::choice("pick")
                .child(
                    ElementDef::block("a")
                        .child(ElementDef::number("digits", 8).min_occurs(0))
                        .child(ElementDef::number("stop", 8).value(0xff).token())
                        .child(ElementDef::number("tail", 8).value(1).token()),
                )
                .child(ElementDef::blob("b")),
        ),
    );
    let data = [5, 6, 0xff, 2];
    let tree = crack(&schema, "M", &data).unwrap();
    assert_eq!(selected(&tree, "M.pick"), "b");
    assert!(tree.find("M.pick.a.digits").is_none());
    assert_eq!(value_at(&tree, "M.pick.b"), bytes(&data));
    assert_eq!(tree.generate_bytes().unwrap(), data.to_vec());
}

#[test]
fn overflowing_relation_expression_is_an_expression_error() {
    let schema = build(
        ElementDef::block("M")
            .child(
                ElementDef::number("len", 64)
                    .signed()
                    .big_endian()
                    .relation(Relation::size_of("data").expressions("size // -1", "size // -1")),
            )
            .child(ElementDef::blob("data")),
    );
    let err = crack(&schema, "M", &[0x80, 0, 0, 0, 0, 0, 0, 0, 1]).unwrap_err();
    assert!(matches!(err, CrackError::Expression { .. }), "{err}");
    assert_eq!(err.element(), Some("M.len"));
}
