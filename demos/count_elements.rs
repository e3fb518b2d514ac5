fn main() {
    use quick_sax::sax::Attributes;
    use quick_sax::{EventSink, Parser, QName};

    let xml = "<tag1>text1</tag1>";
    let nested = "<tag1><tag2>text2</tag2><tag2>text3</tag2></tag1>";

    #[derive(Default)]
    struct Collector {
        count: usize,
        texts: Vec<String>,
    }

    impl EventSink for Collector {
        fn start_element(&mut self, name: &QName, _attributes: &Attributes) {
            if name.raw_name() == "tag2" {
                self.count += 1;
            }
        }
        fn characters(&mut self, text: &str) {
            self.texts.push(text.to_string());
        }
    }

    for doc in [xml, nested] {
        let mut parser = Parser::new(Collector::default());
        parser.feed(doc.as_bytes()).expect("well-formed input");
        parser.finish().expect("complete input");
        let collector = parser.into_sink();
        println!("{} <tag2> elements, texts: {:?}", collector.count, collector.texts);
    }
}
