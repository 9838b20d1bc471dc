use crate::*;

#[derive(Debug, PartialEq)]
enum Shape {
    Point,
    Circle(u64),
    Label(String),
}

impl Pack for Shape {
    fn pack(&self, enc: &mut Encoder) -> Result<()> {
        match self {
            Shape::Point => { enc.variant_begin("Point")?; enc.unit()?; }
            Shape::Circle(r) => { enc.variant_begin("Circle")?; enc.uint(*r)?; }
            Shape::Label(s) => { enc.variant_begin("Label")?; enc.str(s)?; }
        }
        enc.variant_end()
    }
}

impl Unpack for Shape {
    fn unpack(dec: &mut Decoder<'_>) -> Result<Self> {
        let (name, mut body) = dec.variant()?;
        let shape = match name {
            "Point" => { body.unit()?; Shape::Point }
            "Circle" => Shape::Circle(body.uint()?),
            "Label" => Shape::Label(body.str()?.to_owned()),
            other => return Err(Error::UnknownVariant(other.to_owned())),
        };
        body.finish()?;
        Ok(shape)
    }
}

#[test]
fn test_scalars() {
    assert_eq!(unpack::<u64>(&pack(&u64::MAX).unwrap()).unwrap(), u64::MAX);
    assert_eq!(unpack::<bool>(&pack(&true).unwrap()).unwrap(), true);
    assert_eq!(unpack::<String>(&pack("hé").unwrap()).unwrap(), "hé");
    assert_eq!(unpack::<Vec<u8>>(&pack(&vec![0u8, 1, 2]).unwrap()).unwrap(), vec![0, 1, 2]);
}

#[test]
fn test_small_uint_is_two_bytes() {
    assert_eq!(pack(&5u64).unwrap(), vec![Tag::Uint as u8, 5]);
}

#[test]
fn test_u32_range_checked() {
    let bytes = pack(&(u64::from(u32::MAX) + 1)).unwrap();
    assert_eq!(unpack::<u32>(&bytes), Err(Error::IntegerOverflow(u64::from(u32::MAX) + 1)));
}

#[test]
fn test_option() {
    let some: Option<String> = Some("x".into());
    assert_eq!(unpack::<Option<String>>(&pack(&some).unwrap()).unwrap(), some);
    assert_eq!(unpack::<Option<String>>(&pack(&None::<String>).unwrap()).unwrap(), None);
}

#[test]
fn test_variants() {
    for shape in [Shape::Point, Shape::Circle(300), Shape::Label("tag".into())] {
        let bytes = pack(&shape).unwrap();
        assert_eq!(unpack::<Shape>(&bytes).unwrap(), shape);
    }
}

#[test]
fn test_unknown_variant_is_an_error() {
    let mut enc = Encoder::new();
    enc.variant_begin("Square").unwrap();
    enc.unit().unwrap();
    enc.variant_end().unwrap();
    let bytes = enc.into_bytes().unwrap();
    assert_eq!(unpack::<Shape>(&bytes), Err(Error::UnknownVariant("Square".into())));
}

#[test]
fn test_list_iteration_and_skip() {
    let mut enc = Encoder::new();
    enc.list_begin().unwrap();
    enc.uint(1).unwrap();
    enc.str("two").unwrap();
    Shape::Circle(3).pack(&mut enc).unwrap();
    enc.list_end().unwrap();
    let bytes = enc.into_bytes().unwrap();

    let mut dec = Decoder::new(&bytes);
    let mut items = dec.list().unwrap();
    assert_eq!(items.next().unwrap().unwrap().uint().unwrap(), 1);
    let mut second = items.next().unwrap().unwrap();
    second.skip().unwrap();
    assert_eq!(second.remaining(), 0);
    let mut third = items.next().unwrap().unwrap();
    assert_eq!(Shape::unpack(&mut third).unwrap(), Shape::Circle(3));
    assert!(items.next().unwrap().is_none());
    dec.finish().unwrap();
}

#[test]
fn test_variant_requires_exactly_one_payload() {
    let mut enc = Encoder::new();
    enc.variant_begin("Empty").unwrap();
    assert_eq!(enc.variant_end(), Err(Error::NotExactlyOne(Scope::Variant)));

    let mut enc = Encoder::new();
    enc.variant_begin("Twice").unwrap();
    enc.unit().unwrap();
    assert_eq!(enc.unit(), Err(Error::NotExactlyOne(Scope::Variant)));
}

#[test]
fn test_open_scope_cannot_finalize() {
    let mut enc = Encoder::new();
    enc.list_begin().unwrap();
    assert!(matches!(enc.into_bytes(), Err(Error::ScopeStillOpen)));
}

#[test]
fn test_scope_mismatch() {
    let mut enc = Encoder::new();
    enc.list_begin().unwrap();
    assert_eq!(
        enc.variant_end(),
        Err(Error::ScopeMismatch { expected: Scope::Variant, actual: Scope::List })
    );
}

#[test]
fn test_trailing_bytes_rejected() {
    let mut bytes = pack(&7u64).unwrap();
    bytes.push(Tag::Unit as u8);
    assert_eq!(unpack::<u64>(&bytes), Err(Error::TrailingBytes(1)));
}

#[test]
fn test_hostile_input_never_panics() {
    let cases: &[&[u8]] = &[
        &[],
        &[0xff],
        &[Tag::String as u8, 0x05, b'a'],
        &[Tag::Variant as u8, 0xff, 0xff, 0xff, 0x7f],
        &[Tag::List as u8, 0x01],
        &[Tag::Uint as u8, 0x80],
    ];
    for case in cases {
        assert!(unpack::<Shape>(case).is_err());
        assert!(Decoder::new(case).skip().is_err());
    }
}
