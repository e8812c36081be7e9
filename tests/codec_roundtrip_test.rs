//! Codec round trips: every legal value survives `to_wire` then `from_wire`,
//! and `normalize` is what a device would read back.

use instrument_core::codec::{
    BoolCodec, ChoiceDevDep, ChoiceIndex, ChoiceList, ChoiceMultiple, ChoiceSimpleMap,
    ChoiceStrings, Codec, FieldSpec, FloatCodec, IntCodec, SharedCodec, TextCodec,
};
use instrument_core::device::DeviceBuilder;
use instrument_core::instrument::Instrument;
use instrument_core::transport::NullTransport;
use instrument_core::value::Record;
use instrument_core::Value;
use proptest::prelude::*;
use std::sync::Arc;

const KEYWORDS: [&str; 4] = ["VOLTage", "CURRent", "RESistance", "FREQ"];

fn roundtrip(codec: &dyn Codec, value: &Value) -> Value {
    codec.from_wire(&codec.to_wire(value).unwrap()).unwrap()
}

prop_compose! {
    /// Distinct quarter-step values, so equal floats never repeat in a list.
    fn distinct_floats()(steps in prop::collection::btree_set(-400i32..400, 1..8)) -> Vec<Value> {
        steps.into_iter().map(|s| Value::Float(f64::from(s) / 4.0)).collect()
    }
}

prop_compose! {
    fn list_and_pick()(values in distinct_floats())
        (index in 0..values.len(), values in Just(values)) -> (Vec<Value>, usize) {
        (values, index)
    }
}

prop_compose! {
    fn keyword_spelling()(index in 0..KEYWORDS.len(), long in any::<bool>(), upper in any::<bool>())
        -> (usize, String) {
        let keyword = KEYWORDS[index];
        let short: String = keyword.chars().take_while(|c| !c.is_ascii_lowercase()).collect();
        let spelled = if long { keyword.to_string() } else { short };
        let spelled = if upper { spelled.to_ascii_uppercase() } else { spelled.to_ascii_lowercase() };
        (index, spelled)
    }
}

prop_compose! {
    fn reading_record()(label in "[a-zA-Z0-9 _.-]{0,12}", count in any::<i64>(), on in any::<bool>())
        -> Record {
        let mut record = Record::new();
        record.insert("label".into(), Value::Text(label));
        record.insert("count".into(), Value::Int(count));
        record.insert("output".into(), Value::Bool(on));
        record
    }
}

fn reading_codec() -> ChoiceMultiple {
    ChoiceMultiple::new(vec![
        FieldSpec::new("label", Arc::new(TextCodec::new())),
        FieldSpec::new("count", Arc::new(IntCodec)),
        FieldSpec::new("output", Arc::new(ChoiceSimpleMap::on_off())),
    ])
}

proptest! {
    #[test]
    fn floats_roundtrip(v in any::<f64>().prop_filter("finite", |v| v.is_finite())) {
        prop_assert_eq!(roundtrip(&FloatCodec, &Value::Float(v)), Value::Float(v));
    }

    #[test]
    fn integers_normalize_to_floats_of_equal_value(i in -(1i64 << 53)..(1i64 << 53)) {
        let normalized = FloatCodec.normalize(&Value::Int(i)).unwrap();
        prop_assert_eq!(&normalized, &Value::Float(i as f64));
        prop_assert_eq!(FloatCodec.normalize(&normalized).unwrap(), normalized);
    }

    #[test]
    fn ints_and_bools_roundtrip(i in any::<i64>(), b in any::<bool>()) {
        prop_assert_eq!(roundtrip(&IntCodec, &Value::Int(i)), Value::Int(i));
        prop_assert_eq!(roundtrip(&BoolCodec, &Value::Bool(b)), Value::Bool(b));
    }

    #[test]
    fn text_roundtrips_quoted_and_bare(s in "[ -~]{0,24}") {
        let value = Value::Text(s);
        prop_assert_eq!(roundtrip(&TextCodec::new(), &value), value.clone());
        prop_assert_eq!(roundtrip(&TextCodec::quoted(), &value), value);
    }

    #[test]
    fn keywords_roundtrip_in_long_form((index, spelled) in keyword_spelling(), quoted in any::<bool>()) {
        let codec = if quoted {
            ChoiceStrings::new(&KEYWORDS).quoted()
        } else {
            ChoiceStrings::new(&KEYWORDS)
        };
        let long = Value::Text(KEYWORDS[index].to_ascii_lowercase());
        prop_assert_eq!(codec.normalize(&Value::Text(spelled)).unwrap(), long.clone());
        prop_assert_eq!(roundtrip(&codec, &long), long);
    }

    #[test]
    fn simple_map_values_roundtrip(on in any::<bool>(), mode in 0usize..3) {
        let modes = ChoiceSimpleMap::new(vec![("NORM", "normal"), ("AVER", "average"), ("PEAK", "peak")]);
        let value = ["normal", "average", "peak"][mode];
        prop_assert_eq!(roundtrip(&modes, &value.into()), Value::from(value));
        prop_assert_eq!(roundtrip(&ChoiceSimpleMap::on_off(), &on.into()), Value::Bool(on));
    }

    #[test]
    fn index_values_roundtrip((values, index) in list_and_pick(), offset in -5i64..5) {
        let codec = ChoiceIndex::new(values.clone()).with_offset(offset);
        prop_assert_eq!(roundtrip(&codec, &values[index]), values[index].clone());
        let normalized = ChoiceIndex::new(values.clone()).normalized();
        prop_assert_eq!(roundtrip(&normalized, &values[index]), values[index].clone());
    }

    #[test]
    fn list_values_roundtrip((values, index) in list_and_pick()) {
        let bare = ChoiceList::new(values.clone());
        prop_assert_eq!(roundtrip(&bare, &values[index]), values[index].clone());
        let coded = ChoiceList::new(values.clone()).with_codec(Arc::new(FloatCodec));
        prop_assert_eq!(roundtrip(&coded, &values[index]), values[index].clone());
    }

    #[test]
    fn records_roundtrip(record in reading_record()) {
        let codec = reading_codec();
        let value = Value::Record(record);
        prop_assert!(codec.contains(&value));
        prop_assert_eq!(roundtrip(&codec, &value), value);
    }

    #[test]
    fn records_holding_the_separator_are_refused(mut record in reading_record(), at in 0usize..12) {
        let label = record["label"].as_str().unwrap_or_default().to_string();
        let split = at.min(label.len());
        record.insert("label".into(), Value::Text(format!("{},{}", &label[..split], &label[split..])));
        prop_assert!(!reading_codec().contains(&Value::Record(record)));
    }

    #[test]
    fn dependent_choices_roundtrip_for_the_selected_case(
        curr in any::<bool>(),
        (values, index) in list_and_pick(),
    ) {
        let instr = Instrument::builder("dmm", NullTransport).build().unwrap();
        let func = instr
            .add_device(
                DeviceBuilder::memory("func", "volt")
                    .choices(Arc::new(ChoiceList::new(vec!["volt".into(), "curr".into()]))),
            )
            .unwrap();
        let volt: SharedCodec = Arc::new(ChoiceList::new(vec![0.1.into(), 1.0.into(), 10.0.into()]));
        let selected: SharedCodec = Arc::new(ChoiceList::new(values.clone()));
        let codec = ChoiceDevDep::new(&func, vec![("volt".into(), volt), ("curr".into(), selected)]);

        if curr {
            func.set("curr").unwrap();
            prop_assert_eq!(roundtrip(&codec, &values[index]), values[index].clone());
        } else {
            prop_assert_eq!(roundtrip(&codec, &Value::Float(10.0)), Value::Float(10.0));
        }
    }
}
