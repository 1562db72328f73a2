use rand::seq::SliceRandom;
use rand::Rng;

use crate::cards::{timestamp_millis, VerseResult, VerseSuggestion};

/// Offline verse tables keyed by normalized theme. Used when the live
/// suggestion request fails so the caller still gets thematically relevant
/// results instead of an error.
const SUGGESTION_TABLES: &[(&str, &[(&str, &str)])] = &[
    (
        "fé",
        &[
            (
                "Ora, a fé é a certeza daquilo que esperamos e a prova das coisas que não vemos.",
                "Hebreus 11:1",
            ),
            ("Porque vivemos por fé, e não pelo que vemos.", "2 Coríntios 5:7"),
            (
                "Sem fé é impossível agradar a Deus, pois quem dele se aproxima precisa crer que ele existe e que recompensa aqueles que o buscam.",
                "Hebreus 11:6",
            ),
            (
                "Consequentemente, a fé vem por se ouvir a mensagem, e a mensagem é ouvida mediante a palavra de Cristo.",
                "Romanos 10:17",
            ),
            (
                "Jesus olhou para eles e respondeu: \"Para o homem é impossível, mas para Deus todas as coisas são possíveis\".",
                "Mateus 19:26",
            ),
        ],
    ),
    (
        "esperança",
        &[
            (
                "Mas os que esperam no Senhor renovarão as forças, subirão com asas como águias; correrão, e não se cansarão; caminharão, e não se fatigarão.",
                "Isaías 40:31",
            ),
            (
                "Porque sou eu que conheço os planos que tenho para vocês, diz o Senhor, planos de fazê-los prosperar e não de causar dano, planos de dar a vocês esperança e um futuro.",
                "Jeremias 29:11",
            ),
            (
                "Alegrem-se na esperança, sejam pacientes na tribulação, perseverem na oração.",
                "Romanos 12:12",
            ),
            (
                "Bendito o homem que confia no Senhor, e cuja confiança é o Senhor.",
                "Jeremias 17:7",
            ),
        ],
    ),
    (
        "amor",
        &[
            (
                "O amor é paciente, o amor é bondoso. Não inveja, não se vangloria, não se orgulha.",
                "1 Coríntios 13:4",
            ),
            (
                "Acima de tudo, porém, revistam-se do amor, que é o elo perfeito.",
                "Colossenses 3:14",
            ),
            ("Nós amamos porque ele nos amou primeiro.", "1 João 4:19"),
            (
                "Quem não ama não conhece a Deus, porque Deus é amor.",
                "1 João 4:8",
            ),
        ],
    ),
    (
        "gratidão",
        &[
            (
                "Deem graças em todas as circunstâncias, pois esta é a vontade de Deus para vocês em Cristo Jesus.",
                "1 Tessalonicenses 5:18",
            ),
            (
                "Este é o dia em que o Senhor agiu; alegremo-nos e exultemos neste dia.",
                "Salmos 118:24",
            ),
            (
                "Rendam graças ao Senhor, pois ele é bom; o seu amor dura para sempre.",
                "Salmos 107:1",
            ),
            (
                "Bendiga o Senhor a minha alma! Não esqueça de nenhuma de suas bênçãos!",
                "Salmos 103:2",
            ),
        ],
    ),
    (
        "paz",
        &[
            (
                "Deixo-lhes a paz; a minha paz lhes dou. Não a dou como o mundo a dá. Não se perturbem os seus corações, nem tenham medo.",
                "João 14:27",
            ),
            (
                "E a paz de Deus, que excede todo o entendimento, guardará os seus corações e as suas mentes em Cristo Jesus.",
                "Filipenses 4:7",
            ),
            (
                "Bem-aventurados os pacificadores, pois serão chamados filhos de Deus.",
                "Mateus 5:9",
            ),
            (
                "O Senhor dá força ao seu povo; o Senhor dá a seu povo a bênção da paz.",
                "Salmos 29:11",
            ),
            (
                "Em paz me deito e logo adormeço, pois só tu, Senhor, me fazes viver em segurança.",
                "Salmos 4:8",
            ),
        ],
    ),
    (
        "força",
        &[
            ("Tudo posso naquele que me fortalece.", "Filipenses 4:13"),
            (
                "O Senhor é a minha luz e a minha salvação; de quem terei temor? O Senhor é o meu forte refúgio; de quem terei medo?",
                "Salmos 27:1",
            ),
            (
                "Deus é o nosso refúgio e a nossa fortaleza, auxílio sempre presente na adversidade.",
                "Salmos 46:1",
            ),
            (
                "Sejam fortes e corajosos. Não tenham medo nem fiquem apavorados, pois o Senhor, o seu Deus, vai com vocês; nunca os deixará, nunca os abandonará.",
                "Deuteronômio 31:6",
            ),
        ],
    ),
    (
        "ansiedade",
        &[
            (
                "Lançando sobre ele toda a vossa ansiedade, porque ele tem cuidado de vós.",
                "1 Pedro 5:7",
            ),
            (
                "Não andeis ansiosos por coisa alguma; antes em tudo sejam os vossos pedidos conhecidos diante de Deus pela oração e súplica com ações de graças.",
                "Filipenses 4:6",
            ),
            (
                "Busquei ao Senhor, e ele me respondeu; livrou-me de todos os meus temores.",
                "Salmos 34:4",
            ),
            (
                "A ansiedade no coração do homem o abate, mas uma boa palavra o alegra.",
                "Provérbios 12:25",
            ),
        ],
    ),
    (
        "perdão",
        &[
            (
                "Antes sede uns para com os outros benignos, misericordiosos, perdoando-vos uns aos outros, como também Deus vos perdoou em Cristo.",
                "Efésios 4:32",
            ),
            (
                "Se confessarmos os nossos pecados, ele é fiel e justo para nos perdoar os pecados, e nos purificar de toda a injustiça.",
                "1 João 1:9",
            ),
            (
                "Porque, se perdoardes aos homens as suas ofensas, também vosso Pai celestial vos perdoará a vós.",
                "Mateus 6:14",
            ),
            (
                "Tu, Senhor, és bom, e pronto a perdoar, e abundante em benignidade para todos os que te invocam.",
                "Salmos 86:5",
            ),
        ],
    ),
];

/// Ready-made cards so a first launch with no connectivity still renders
/// something complete.
const SEED_CARDS: &[(&str, &str, &str, &str)] = &[
    (
        "O Senhor é o meu pastor, nada me faltará.",
        "Salmos 23:1",
        "Uma declaração de confiança absoluta na provisão, no cuidado e na proteção de Deus sobre nossas vidas em todos os momentos.",
        "https://images.unsplash.com/photo-1470071459604-3b5ec3a7fe05?q=80&w=720&h=1280&auto=format&fit=crop",
    ),
    (
        "Porque sou eu que conheço os planos que tenho para vocês, diz o Senhor, planos de fazê-los prosperar e não de causar dano, planos de dar a vocês esperança e um futuro.",
        "Jeremias 29:11",
        "Uma promessa poderosa de que Deus tem o controle do nosso destino e que Seus propósitos são sempre para o nosso bem e crescimento.",
        "https://images.unsplash.com/photo-1507643179173-442727e34eac?q=80&w=720&h=1280&auto=format&fit=crop",
    ),
    (
        "O amor é paciente, o amor é bondoso. Não inveja, não se vangloria, não se orgulha.",
        "1 Coríntios 13:4",
        "A definição divina do amor verdadeiro, que não se baseia em sentimentos passageiros, mas em atitudes de bondade e paciência.",
        "https://images.unsplash.com/photo-1518173946687-a4c8892bbd9f?q=80&w=720&h=1280&auto=format&fit=crop",
    ),
    (
        "Tudo posso naquele que me fortalece.",
        "Filipenses 4:13",
        "Um lembrete de que nossa força não vem de nós mesmos, mas da capacidade que Deus nos dá para enfrentar qualquer desafio.",
        "https://images.unsplash.com/photo-1464822759023-fed622ff2c3b?q=80&w=720&h=1280&auto=format&fit=crop",
    ),
    (
        "Deixo-lhes a paz; a minha paz lhes dou. Não a dou como o mundo a dá. Não se perturbem os seus corações, nem tenham medo.",
        "João 14:27",
        "Jesus oferece uma paz sobrenatural que independe das circunstâncias externas, acalmando nossos corações em meio às tempestades.",
        "https://images.unsplash.com/photo-1507525428034-b723cf961d3e?q=80&w=720&h=1280&auto=format&fit=crop",
    ),
];

fn normalize_theme(theme: &str) -> String {
    theme.trim().to_lowercase()
}

fn suggestions_from(rows: &[(&str, &str)]) -> Vec<VerseSuggestion> {
    rows.iter()
        .map(|(text, reference)| VerseSuggestion::new(*text, *reference))
        .collect()
}

/// Dictionary lookup: the normalized theme must contain a known key.
pub fn themed_suggestions(theme: &str) -> Option<Vec<VerseSuggestion>> {
    let normalized = normalize_theme(theme);
    if normalized.is_empty() {
        return None;
    }
    SUGGESTION_TABLES
        .iter()
        .find(|entry| normalized.contains(entry.0))
        .map(|entry| suggestions_from(entry.1))
}

/// Random picks from the flattened pool, for themes with no dictionary match.
/// Reshuffled on every call so repeated failures do not pin the same list.
pub fn pooled_suggestions<R: Rng + ?Sized>(count: usize, rng: &mut R) -> Vec<VerseSuggestion> {
    let mut pool: Vec<VerseSuggestion> = SUGGESTION_TABLES
        .iter()
        .flat_map(|(_, rows)| suggestions_from(rows))
        .collect();
    pool.shuffle(rng);
    pool.truncate(count);
    pool
}

/// Dictionary match first, randomized pool otherwise.
pub fn suggestions_for_theme<R: Rng + ?Sized>(
    theme: &str,
    count: usize,
    rng: &mut R,
) -> Vec<VerseSuggestion> {
    themed_suggestions(theme).unwrap_or_else(|| pooled_suggestions(count, rng))
}

/// One complete offline card with a fresh timestamp.
pub fn seed_card<R: Rng + ?Sized>(rng: &mut R) -> VerseResult {
    let (text, reference, explanation, image_url) = SEED_CARDS
        .choose(rng)
        .copied()
        .unwrap_or(SEED_CARDS[0]);
    VerseResult {
        id: crate::cards::fresh_card_id(),
        verse_text: text.to_string(),
        verse_reference: reference.to_string(),
        explanation: explanation.to_string(),
        image_url: image_url.to_string(),
        is_favorite: false,
        created_at: timestamp_millis(),
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::{pooled_suggestions, seed_card, suggestions_for_theme, themed_suggestions};

    #[test]
    fn themed_lookup_matches_by_substring() {
        let suggestions = themed_suggestions("Versículos sobre a Paz").unwrap_or_default();
        assert_eq!(suggestions.len(), 5);
        assert!(suggestions
            .iter()
            .any(|row| row.verse_reference == "João 14:27"));
    }

    #[test]
    fn unknown_theme_falls_back_to_pool() {
        let mut rng = StdRng::seed_from_u64(7);
        let suggestions = suggestions_for_theme("finanças", 5, &mut rng);
        assert_eq!(suggestions.len(), 5);
        assert!(suggestions.iter().all(|row| row.is_complete()));
    }

    #[test]
    fn pool_sampling_is_reshuffled() {
        let mut rng_a = StdRng::seed_from_u64(1);
        let mut rng_b = StdRng::seed_from_u64(2);
        let first = pooled_suggestions(5, &mut rng_a);
        let second = pooled_suggestions(5, &mut rng_b);
        assert_ne!(first, second);
    }

    #[test]
    fn seed_cards_are_complete() {
        let mut rng = StdRng::seed_from_u64(3);
        let card = seed_card(&mut rng);
        assert!(!card.id.is_empty());
        assert!(!card.explanation.is_empty());
        assert!(!card.image_url.is_empty());
        assert!(card.created_at > 0);
    }
}
