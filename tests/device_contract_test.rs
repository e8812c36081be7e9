//! Device contract: check before set, cache only confirmed values, option
//! changes invalidate the cache, dry-run mode never touches the transport.

use instrument_core::codec::{ChoiceDevDep, ChoiceList, ChoiceStrings, IntCodec, SharedCodec};
use instrument_core::device::{DeviceBuilder, FnBackend, OptionSpec, OptionValues, ScpiBackend};
use instrument_core::instrument::Instrument;
use instrument_core::limits::Limits;
use instrument_core::transport::{MockTransport, NullTransport};
use instrument_core::{DaqError, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn mock_instrument(name: &str) -> (Arc<Instrument>, Arc<MockTransport>) {
    let mock = Arc::new(MockTransport::new());
    let instr = Instrument::builder(name, Arc::clone(&mock)).build().unwrap();
    (instr, mock)
}

fn opts(pairs: &[(&str, Value)]) -> OptionValues {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[test]
fn memory_device_returns_what_was_set() {
    let instr = Instrument::builder("sim", NullTransport).build().unwrap();
    let dev = instr.add_device(DeviceBuilder::memory("level", 0.0)).unwrap();
    dev.set(5.0).unwrap();
    assert_eq!(dev.get().unwrap(), Value::Float(5.0));
}

#[test]
fn set_caches_the_value_the_codec_reads_back() {
    let instr = Instrument::builder("sim", NullTransport).build().unwrap();
    let level = instr.add_device(DeviceBuilder::memory("level", 0.0)).unwrap();
    level.set(5).unwrap();
    assert_eq!(level.get().unwrap(), Value::Float(5.0));

    let mode = instr
        .add_device(
            DeviceBuilder::memory("mode", "volt")
                .codec(Arc::new(ChoiceStrings::new(&["VOLTage", "CURRent"]))),
        )
        .unwrap();
    assert_eq!(mode.get().unwrap(), Value::from("voltage"));
    mode.set("CURR").unwrap();
    assert_eq!(mode.get().unwrap(), Value::from("current"));
}

#[test]
fn integer_and_float_options_share_a_cache_entry() {
    let (instr, mock) = mock_instrument("dmm");
    let channel = instr
        .add_device(DeviceBuilder::memory("channel", 1.0).limits(Limits::range(1.0, 4.0)))
        .unwrap();
    let meas = instr
        .add_device(
            DeviceBuilder::scpi("meas", "MEAS{ch}").option(OptionSpec::device("ch", &channel)),
        )
        .unwrap();

    meas.set_with(2.0, &opts(&[("ch", Value::Int(1))])).unwrap();
    assert_eq!(meas.getcache().unwrap(), Some(Value::Float(2.0)));
    assert_eq!(mock.writes(), vec!["MEAS1.0 2.0"]);
}

#[test]
fn out_of_range_check_leaves_cache_unchanged() {
    let (instr, mock) = mock_instrument("src");
    let dev = instr
        .add_device(DeviceBuilder::scpi("volt", "VOLT").limits(Limits::at_most(10.0)))
        .unwrap();
    dev.set(3.0).unwrap();

    let err = dev.check(999).unwrap_err();
    assert!(matches!(err, DaqError::InvalidArgument(_)));
    assert!(!err.is_recoverable());
    assert!(dev.set(999).is_err());
    assert_eq!(dev.cache().shared(), Some(Value::Float(3.0)));
    assert_eq!(mock.writes(), vec!["VOLT 3.0"]);
}

#[test]
fn repeated_getcache_reads_hardware_once() {
    let (instr, mock) = mock_instrument("dmm");
    mock.set_reply("TEMP?", "21.5");
    let temp = instr
        .add_device(DeviceBuilder::new("temp").backend(ScpiBackend::query("TEMP?")))
        .unwrap();
    assert_eq!(temp.getcache().unwrap(), Some(Value::Float(21.5)));
    assert_eq!(temp.getcache().unwrap(), Some(Value::Float(21.5)));
    assert_eq!(mock.query_count("TEMP?"), 1);

    temp.get().unwrap();
    assert_eq!(mock.query_count("TEMP?"), 2);
}

#[test]
fn changing_an_option_invalidates_the_cache() {
    let (instr, mock) = mock_instrument("scope");
    let channel = instr
        .add_device(DeviceBuilder::memory("channel", 1).limits(Limits::range(1, 4)))
        .unwrap();
    let scale = instr
        .add_device(
            DeviceBuilder::new("scale")
                .backend(ScpiBackend::command("CH{ch}:SCALE"))
                .option(OptionSpec::device("ch", &channel)),
        )
        .unwrap();
    mock.set_reply("CH1:SCALE?", "0.5");
    mock.set_reply("CH3:SCALE?", "2.0");

    assert_eq!(scale.getcache().unwrap(), Some(Value::Float(0.5)));
    channel.set(3).unwrap();
    assert_eq!(scale.getcache().unwrap(), Some(Value::Float(2.0)));
    channel.set(1).unwrap();
    assert_eq!(scale.getcache().unwrap(), Some(Value::Float(0.5)));
    assert_eq!(mock.query_count("CH1:SCALE?"), 2);
}

#[test]
fn unresolvable_default_option_is_recoverable() {
    let (instr, mock) = mock_instrument("dmm");
    let range = instr
        .add_device(DeviceBuilder::new("range").backend(ScpiBackend::command("RANG")).autoinit(0))
        .unwrap();
    let meas = instr
        .add_device(
            DeviceBuilder::new("meas")
                .backend(ScpiBackend::query("MEAS? {range}"))
                .option(OptionSpec::device("range", &range)),
        )
        .unwrap();

    let err = meas.get().unwrap_err();
    assert!(matches!(err, DaqError::InvalidAutoArgument(_)));
    assert_eq!(meas.getcache().unwrap(), None);

    mock.set_reply("MEAS? 10.0", "1.25");
    assert_eq!(
        meas.get_with(&opts(&[("range", 10.0.into())])).unwrap(),
        Value::Float(1.25)
    );
    assert!(mock.writes().iter().all(|w| !w.starts_with("RANG ")));
}

#[test]
fn literal_option_with_converter_renders_template() {
    let (instr, mock) = mock_instrument("gen");
    let freq = instr
        .add_device(
            DeviceBuilder::new("freq")
                .backend(ScpiBackend::write_only("SOUR{out}:FREQ {val}"))
                .option(
                    OptionSpec::value("out", "a")
                        .with_limits(Limits::one_of(vec!["a".into(), "b".into()]))
                        .with_converter(|_, wire| if wire == "a" { "1".into() } else { "2".into() }),
                ),
        )
        .unwrap();
    freq.set(1e3).unwrap();
    freq.set_with(2e3, &opts(&[("out", "b".into())])).unwrap();
    assert_eq!(mock.writes(), vec!["SOUR1:FREQ 1000.0", "SOUR2:FREQ 2000.0"]);
    assert!(freq.set_with(1.0, &opts(&[("out", "c".into())])).is_err());
}

#[test]
fn failed_write_keeps_stale_cache() {
    let (instr, mock) = mock_instrument("psu");
    let out = instr.add_device(DeviceBuilder::scpi("out", "OUTP")).unwrap();
    out.set(1.0).unwrap();
    mock.fail_next("GPIB timeout");
    let err = out.set(0.0).unwrap_err();
    assert!(matches!(err, DaqError::Communication(_)));
    assert_eq!(out.getcache().unwrap(), Some(Value::Float(1.0)));
}

#[test]
fn setget_caches_hardware_adjusted_value() {
    let (instr, mock) = mock_instrument("gen");
    let ampl = instr
        .add_device(DeviceBuilder::scpi("ampl", "AMPL").setget())
        .unwrap();
    mock.queue_reply("AMPL?", "0.502");
    ampl.set(0.5).unwrap();
    assert_eq!(ampl.getcache().unwrap(), Some(Value::Float(0.502)));
    assert_eq!(mock.writes(), vec!["AMPL 0.5", "AMPL?"]);
}

#[test]
fn read_only_and_write_only_devices_refuse_the_other_direction() {
    let (instr, _mock) = mock_instrument("dmm");
    let trig = instr
        .add_device(DeviceBuilder::new("trig").backend(ScpiBackend::write_only("*TRG")))
        .unwrap();
    let meas = instr
        .add_device(DeviceBuilder::new("meas").backend(ScpiBackend::query("MEAS?")))
        .unwrap();
    assert!(matches!(trig.get(), Err(DaqError::NotImplemented(_))));
    assert!(matches!(meas.set(0.0), Err(DaqError::NotImplemented(_))));
    assert!(matches!(meas.check(0.0), Err(DaqError::NotImplemented(_))));
}

#[test]
fn checking_mode_validates_options_without_io() {
    let (instr, mock) = mock_instrument("dmm");
    let func = instr
        .add_device(
            DeviceBuilder::scpi("func", "FUNC")
                .choices(Arc::new(ChoiceStrings::new(&["VOLTage", "CURRent"]))),
        )
        .unwrap();
    let range = instr
        .add_device(
            DeviceBuilder::scpi("range", "RANG")
                .option(OptionSpec::value("ch", 1).with_limits(Limits::range(1, 2))),
        )
        .unwrap();

    let _checking = instr.checking_scope(true);
    func.set("curr").unwrap();
    assert!(func.set("ohms").is_err());
    assert!(range.set_with(10.0, &opts(&[("ch", 5.into())])).is_err());
    range.set(10.0).unwrap();
    assert_eq!(range.get().unwrap(), Value::Float(10.0));
    assert!(matches!(
        instr.device("func").unwrap().get_with(&opts(&[("x", 1.into())])),
        Err(DaqError::InvalidArgument(_))
    ));
    assert!(mock.writes().is_empty());
}

#[test]
fn dependent_choices_follow_selector() {
    let (instr, _mock) = mock_instrument("dmm");
    let func = instr
        .add_device(
            DeviceBuilder::memory("func", "volt")
                .choices(Arc::new(ChoiceList::new(vec!["volt".into(), "curr".into()]))),
        )
        .unwrap();
    let volt_ranges: SharedCodec = Arc::new(ChoiceList::new(vec![0.1.into(), 1.0.into(), 10.0.into()]));
    let curr_ranges: SharedCodec = Arc::new(ChoiceList::new(vec![0.001.into(), 0.01.into()]));
    let range = instr
        .add_device(DeviceBuilder::scpi("range", "RANG").choices(Arc::new(ChoiceDevDep::new(
            &func,
            vec![("volt".into(), volt_ranges), ("curr".into(), curr_ranges)],
        ))))
        .unwrap();

    range.check(10.0).unwrap();
    assert!(range.check(0.01).is_err());
    func.set("curr").unwrap();
    range.check(0.01).unwrap();
    assert!(range.check(10.0).is_err());
}

#[test]
fn closure_backend_and_thread_local_cache() {
    let reads = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&reads);
    let instr = Instrument::builder("sim", NullTransport).build().unwrap();
    let dev = instr
        .add_device(
            DeviceBuilder::new("counter")
                .backend(FnBackend::new().getter(move |_, _| {
                    Ok(Value::Int(counter.fetch_add(1, Ordering::SeqCst) as i64 + 1))
                }))
                .codec(Arc::new(IntCodec)),
        )
        .unwrap();

    assert_eq!(dev.get().unwrap(), Value::Int(1));
    let remote = Arc::clone(&dev);
    std::thread::spawn(move || remote.get().unwrap())
        .join()
        .unwrap();
    assert_eq!(dev.getcache().unwrap(), Some(Value::Int(2)));
    assert_eq!(dev.getcache_local().unwrap(), Some(Value::Int(1)));
    assert_eq!(reads.load(Ordering::SeqCst), 2);
}

#[test]
fn setcache_and_invalidate() {
    let (instr, mock) = mock_instrument("dmm");
    mock.set_reply("NPLC?", "10");
    let nplc = instr
        .add_device(DeviceBuilder::scpi("nplc", "NPLC").codec(Arc::new(IntCodec)))
        .unwrap();
    nplc.setcache(Some(Value::Int(1))).unwrap();
    assert_eq!(nplc.getcache().unwrap(), Some(Value::Int(1)));
    nplc.setcache(None).unwrap();
    assert_eq!(nplc.getcache().unwrap(), Some(Value::Int(10)));
}

#[test]
fn full_name_uses_header_device() {
    let (instr, _mock) = mock_instrument("dmm");
    let volt = instr.add_device(DeviceBuilder::scpi("volt", "VOLT")).unwrap();
    assert_eq!(volt.full_name(), "dmm.volt");
    instr.device("header").unwrap().set("keithley").unwrap();
    assert_eq!(volt.full_name(), "keithley.volt");
}

#[test]
fn getformat_header_defaults_to_configuration_snapshot() {
    let (instr, _mock) = mock_instrument("dmm");
    let volt = instr.add_device(DeviceBuilder::scpi("volt", "VOLT")).unwrap();
    let trace = instr
        .add_device(
            DeviceBuilder::new("trace")
                .backend(ScpiBackend::query("DATA?").raw())
                .codec(Arc::new(instrument_core::codec::BytesCodec))
                .binary("npy")
                .multi(vec!["t", "v"]),
        )
        .unwrap();
    volt.set(1.0).unwrap();

    let format = trace.getformat(&OptionValues::new()).unwrap();
    assert!(format.is_binary());
    assert_eq!(format.multi.clone().unwrap(), vec!["t", "v"]);
    let mut out = Vec::new();
    format.write_header(&trace, &mut out).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "#volt=1.0\n#t\tv\n");
}
