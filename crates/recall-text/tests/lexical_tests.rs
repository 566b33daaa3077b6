use chrono::Utc;
use recall_core::config::LexicalConfig;
use recall_core::types::Document;
use recall_core::Chunker;
use recall_text::LexicalIndex;

fn index_doc(idx: &mut LexicalIndex, source: &str, text: &str) -> usize {
    let chunker = Chunker::with_sizes(800, 100).expect("chunker");
    let doc = Document::new(source, text, Utc::now());
    chunker.chunk(&doc).filter(|c| idx.add(c)).count()
}

#[test]
fn rare_term_ranks_its_chunk_first() {
    let mut idx = LexicalIndex::new(LexicalConfig::default()).expect("index");
    let notes = [
        ("garden.md", "Tomatoes want full sun and steady water. Mulch keeps roots cool."),
        ("pantry.md", "Canning tomatoes requires acid. Pressure canning is for low-acid food."),
        ("bees.md", "A strong hive needs a queen, water nearby and forage in spring."),
    ];
    for (source, text) in notes {
        index_doc(&mut idx, source, text);
    }

    let hits = idx.search("pressure canning", 10).expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(idx.doc(&hits[0].0).map(|d| d.source_id.as_str()), Some("pantry.md"));

    let water = idx.search("water", 10).expect("search");
    assert_eq!(water.len(), 2);
    assert!(water[0].1 >= water[1].1);
}

#[test]
fn reingesting_same_source_adds_nothing() {
    let mut idx = LexicalIndex::new(LexicalConfig::default()).expect("index");
    let text = "firewood ".repeat(300);
    let first = index_doc(&mut idx, "wood.txt", &text);
    let postings = idx.posting_count();
    let second = index_doc(&mut idx, "wood.txt", &text);
    assert!(first > 1);
    assert_eq!(second, 0);
    assert_eq!(idx.posting_count(), postings);
}

#[test]
fn stop_words_can_be_kept() {
    let params = LexicalConfig { stop_words: false, ..LexicalConfig::default() };
    let mut idx = LexicalIndex::new(params).expect("index");
    index_doc(&mut idx, "a.txt", "to be or not to be");
    assert_eq!(idx.search("be", 5).expect("search").len(), 1);
}

#[test]
fn invalid_params_are_rejected() {
    let params = LexicalConfig { b: 1.5, ..LexicalConfig::default() };
    assert!(LexicalIndex::new(params).is_err());
}
